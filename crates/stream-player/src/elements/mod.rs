//! The three elements of a playback pipeline.

mod decoder;
mod reader;
mod writer;

pub use decoder::DecoderElement;
pub use reader::ReaderElement;
pub use writer::WriterElement;
