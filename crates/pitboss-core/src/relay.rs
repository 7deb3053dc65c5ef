//! Frame relay between hops.

use futures_util::StreamExt;
use tracing::warn;

use pitboss_contracts::wire::JobFrame;

use crate::traits::{FrameStream, JobFrames};

/// Relay frames from the hop below until the first terminal frame. A broken
/// or prematurely ended upstream becomes one `upstream_closed` frame, so the
/// relayed stream always ends with exactly one terminal frame. Dropping the
/// returned stream drops `upstream`.
pub fn relay_frames(mut upstream: FrameStream, source: impl Into<String>) -> JobFrames {
    let source = source.into();
    let frames = async_stream::stream! {
        loop {
            match upstream.next().await {
                Some(Ok(frame)) => {
                    let terminal = frame.is_terminal();
                    yield frame;
                    if terminal {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(source = %source, error = %e, "job stream broke");
                    yield JobFrame::upstream_failed(&e);
                    break;
                }
                None => {
                    yield JobFrame::upstream_closed(format!(
                        "'{source}' closed the stream without a terminal frame"
                    ));
                    break;
                }
            }
        }
    };
    Box::pin(frames)
}
