//! Keeps inference running ahead of the playback cursor.

use crate::error::Result;
use crate::playlist::{Cursor, Playlist};
use std::sync::Arc;
use tracing::{debug, warn};

/// Synthesize the phrases following `cursor` until `budget` phonemes have
/// been covered or the text ends.
///
/// Waits for the phrase at the cursor first, then walks forward one phrase at
/// a time, each request issued only after the previous one completed. The
/// budget is checked before each phrase, so the total overshoots it by less
/// than one phrase. Returns the number of phonemes covered.
pub async fn prefetch(playlist: Arc<Playlist>, cursor: Cursor, budget: usize) -> Result<usize> {
    let mut unit = cursor.unit;
    let mut phrase = cursor.phrase;
    let mut phrases = playlist.phrases(unit).await?;

    if let Some(current) = phrases.get(phrase) {
        playlist.pcm(current).await?;
    }

    let mut covered = 0;
    while covered < budget {
        if phrase + 1 < phrases.len() {
            phrase += 1;
        } else if unit + 1 < playlist.len() {
            unit += 1;
            phrase = 0;
            phrases = playlist.phrases(unit).await?;
        } else {
            break;
        }

        if let Some(entry) = phrases.get(phrase) {
            playlist.pcm(entry).await?;
            covered += entry.phrase.phonemes.len();
        }
    }

    debug!(target: "prefetch", unit, phrase, covered, "Prefetch reached");
    Ok(covered)
}

/// Run [`prefetch`] as a session task. Failures are only logged: a phrase that
/// failed here fails again, for real, when playback reaches it.
pub fn spawn_prefetch(
    playlist: &Arc<Playlist>,
    cursor: Cursor,
    budget: usize,
) -> tokio::task::AbortHandle {
    let list = playlist.clone();
    playlist
        .tasks()
        .spawn(async move {
            if let Err(e) = prefetch(list, cursor, budget).await {
                if e.is_cancellation() {
                    debug!(target: "prefetch", "Prefetch cancelled");
                } else {
                    warn!(target: "prefetch", error = %e, "Prefetch failed");
                }
            }
        })
        .abort_handle()
}
