pub mod buffered_reader;
pub mod buffered_writer;
pub mod storage;

pub use buffered_reader::BufferedReader;
pub use buffered_writer::{BufferedWriter, WriteMode};
pub use storage::{FileKind, Storage};
