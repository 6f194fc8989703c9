//! # Paths
//!
//! Canonical item paths and the normalization used to key the embed cache.
//!
//! - Item paths are directory-like: `/{collection}/{key}/`
//! - A trailing `@@frame` segment selects the render frame: `/genes/1/@@embedded`
//! - Relative paths resolve against the base item's path

use crate::primitives::FRAME_MARKER;
use crate::{Frame, ItemId, TrellisError};

/// Canonical path of an item in a collection.
#[must_use]
pub fn canonical(collection: &str, id: ItemId) -> String {
    format!("/{}/{}/", collection, id)
}

/// Non-empty segments of a path.
#[must_use]
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Resolve `relative` against `base` into an absolute, normalized path.
///
/// `.` and `..` segments are collapsed. A frame segment is only allowed last.
/// The result is the embed cache key, so equal targets must normalize equally.
pub fn normalize(base: &str, relative: &str) -> Result<String, TrellisError> {
    let mut stack: Vec<&str> = Vec::new();
    if !relative.starts_with('/') {
        for seg in segments(base) {
            if !seg.starts_with(FRAME_MARKER) {
                stack.push(seg);
            }
        }
    }

    let rel_segments = segments(relative);
    for (i, seg) in rel_segments.iter().enumerate() {
        match *seg {
            "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(TrellisError::InvalidPath(format!(
                        "{} escapes the root from {}",
                        relative, base
                    )));
                }
            }
            s if s.starts_with(FRAME_MARKER) => {
                if i + 1 != rel_segments.len() {
                    return Err(TrellisError::InvalidPath(format!(
                        "frame selector must be the last segment: {}",
                        relative
                    )));
                }
                stack.push(s);
            }
            s => stack.push(s),
        }
    }

    let frame_last = stack.last().is_some_and(|s| s.starts_with(FRAME_MARKER));
    let mut out = String::from("/");
    out.push_str(&stack.join("/"));
    if !frame_last && !stack.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Split a normalized path into its item path and requested frame.
///
/// Without a frame segment the object frame is implied.
pub fn split_frame(path: &str) -> Result<(String, Frame), TrellisError> {
    let mut segs = segments(path);
    let frame = match segs.last().and_then(|s| s.strip_prefix(FRAME_MARKER)) {
        Some(name) => {
            let frame = name.parse::<Frame>()?;
            segs.pop();
            frame
        }
        None => Frame::Object,
    };
    Ok((format!("/{}/", segs.join("/")), frame))
}

/// Attach a frame selector to an item path.
#[must_use]
pub fn with_frame(item_path: &str, frame: Frame) -> String {
    let trimmed = item_path.trim_end_matches('/');
    format!("{}/{}{}", trimmed, FRAME_MARKER, frame.as_str())
}
