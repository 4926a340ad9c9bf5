//! Maps a runtime [`Failure`] back to a line of the authored script.
//!
//! Compiled code fails through frames that do not line up with the source the
//! user wrote. Explicit line metadata from a compile or evaluation error is
//! trusted first; failing that, call frames from the script execution domain are
//! scanned, preferring the top-level source over inline evaluated snippets.

use crate::failure::{Failure, Frame};

/// Origin marker carried by frames raised from compiled script code.
pub const SCRIPT_FRAME_ORIGIN: &str = "kiln::script";

/// Source name of the top-level compiled script.
pub const TOP_LEVEL_SOURCE: &str = "<main>";

/// Prefix of source names given to inline evaluated snippets.
pub const EVAL_SOURCE_PREFIX: &str = "<eval>";

/// Best-guess line in the authored source, or `None` when nothing in the chain
/// points at script code.
///
/// The chain is walked outermost first. The first cause with an explicit line
/// wins outright. Otherwise the last frame match found anywhere in the walk is
/// reported, so an inner cause overrides an outer one.
pub fn locate(failure: &Failure) -> Option<u32> {
    let mut found = None;
    for cause in failure.chain() {
        if let Some(line) = cause.line() {
            return Some(line);
        }
        if let Some(line) = scan_frames(cause.frames()) {
            found = Some(line);
        }
    }
    found
}

fn scan_frames(frames: &[Frame]) -> Option<u32> {
    let mut top_level = None;
    let mut inline = None;
    for frame in frames
        .iter()
        .filter(|f| f.origin.starts_with(SCRIPT_FRAME_ORIGIN))
    {
        if frame.source.starts_with(TOP_LEVEL_SOURCE) {
            top_level = Some(frame.line);
        } else if frame.source.starts_with(EVAL_SOURCE_PREFIX) {
            inline = Some(frame.line);
        }
    }
    top_level.or(inline)
}
