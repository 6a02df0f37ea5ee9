//! Subscription registry: live membership in the Channels Table plus the
//! durable mirror, and channel fan-out.

use chan_protocol::ServerFrame;
use std::collections::HashSet;

use crate::error::GatewayError;
use crate::repo;
use crate::state::AppState;
use crate::tables::Session;
use crate::util::now_millis;

/// Result of one fan-out pass over a channel.
#[derive(Debug, Default)]
pub struct FanoutOutcome {
    /// (fd, profile_id) pairs the frame was pushed to.
    pub delivered: Vec<(u64, i64)>,
    /// Durable subscribers with no established connection; candidates for a
    /// digest upsert by the caller.
    pub offline_profiles: Vec<i64>,
}

/// Add `fd` to a channel.  Requires an active session.  The durable mirror
/// is written first so a crash between the two writes leaves only
/// recoverable state; the Channels Table insert is what makes delivery
/// live.  A membership the live table refuses must not linger in the
/// mirror, so a `CapacityExhausted` rolls back the row this call created
/// (and only that one; another connection of the same profile may own an
/// older row).  Idempotent; `Ok(false)` means the membership already
/// existed.
pub async fn subscribe(
    state: &AppState,
    fd: u64,
    session: &Session,
    channel: &str,
) -> Result<bool, GatewayError> {
    let mirrored =
        repo::subscriptions::persist_subscription(&state.pool, session.profile_id, channel, now_millis())
            .await?;
    match state.tables.channels.insert(channel, fd) {
        Ok(inserted) => Ok(inserted),
        Err(e) => {
            if mirrored {
                repo::subscriptions::remove_subscription(&state.pool, session.profile_id, channel)
                    .await?;
            }
            Err(e.into())
        }
    }
}

/// Remove `fd` from a channel and drop the durable mirror row.  Idempotent;
/// no error when absent.
pub async fn unsubscribe(
    state: &AppState,
    fd: u64,
    session: &Session,
    channel: &str,
) -> Result<(), GatewayError> {
    state.tables.channels.remove(channel, fd);
    repo::subscriptions::remove_subscription(&state.pool, session.profile_id, channel).await?;
    Ok(())
}

pub fn members_of(state: &AppState, channel: &str) -> Vec<u64> {
    state.tables.channels.members_of(channel)
}

pub fn channels_of(state: &AppState, fd: u64) -> Vec<String> {
    state.tables.channels.channels_of(fd)
}

/// Push `frame` to every established subscriber of `channel`, collecting
/// durable subscribers that are offline.
///
/// `exclude_fd` skips the sender's own connection.  Messages pushed from a
/// single publisher stay in publish order per subscriber: the publisher's
/// frames are handled sequentially and each subscriber drains a FIFO
/// outbound queue.
pub async fn fanout(
    state: &AppState,
    channel: &str,
    frame: &ServerFrame,
    exclude_fd: Option<u64>,
) -> Result<FanoutOutcome, GatewayError> {
    let mut outcome = FanoutOutcome::default();
    let mut online_profiles: HashSet<i64> = HashSet::new();
    let mut excluded_profile = None;

    for fd in state.tables.channels.members_of(channel) {
        let Some(session) = state.tables.sessions.get(fd) else {
            // Close cleanup in progress; the durable mirror decides whether
            // this profile gets a digest instead.
            continue;
        };
        if exclude_fd == Some(fd) {
            excluded_profile = Some(session.profile_id);
            continue;
        }
        if state.connections.push(fd, frame.clone()) {
            online_profiles.insert(session.profile_id);
            outcome.delivered.push((fd, session.profile_id));
        }
    }

    for profile_id in repo::subscriptions::subscribers_of(&state.pool, channel).await? {
        if !online_profiles.contains(&profile_id) && excluded_profile != Some(profile_id) {
            outcome.offline_profiles.push(profile_id);
        }
    }

    Ok(outcome)
}
