//! Port traits. API boundaries for the hexagon.
//!
//! Outbound only: the pipeline calls into the message source, the transcoder
//! and the note renderer; adapters implement them.

pub mod outbound;

pub use outbound::{MessageSource, NoteRenderer, TranscoderPort};
