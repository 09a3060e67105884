//! Module containing anything and everything related to data and data
//! structures

pub mod structures;
pub mod synthetic_data;
pub mod table_io;
