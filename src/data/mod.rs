//! Sample persistence: the in-memory ring, daily CSV files and startup recovery.
pub mod day_file;
pub mod recovery;
pub mod ring_buffer;

pub use day_file::{day_file_name, day_file_name_at, DayFileWriter};
pub use recovery::{read_day_file, recover, ImportStats};
pub use ring_buffer::SampleRing;
