pub mod codec;
pub mod index;
pub mod map_file;

pub use index::{IndexEntry, MapFileIndex};
pub use map_file::{MapFile, MapFileSettings, OpenMode};
