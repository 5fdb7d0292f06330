use tracing::{debug, info};
use watchsync_models::{MediaItem, MediaKind, ServerUser, WatchState};
use watchsync_sources::{MediaServer, SourceError};

/// Smallest rating difference worth a write.
const RATING_EPSILON: f32 = 0.05;

/// One destination mutation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ApplyAction {
    MarkUnwatched,
    MarkWatched,
    UpdateProgress(u64),
    Rate(f32),
}

/// Mutations that take `current` to `desired`.
///
/// Servers only expose "one more play" and "reset", so the view count is
/// reached by resetting when the destination is ahead and by adding plays
/// when it is behind. A watched item that is being rewatched keeps its
/// resume point; it is written after the plays, which clear it. An empty
/// plan means the item is already in the desired state, which is what
/// makes applying twice a no-op.
pub fn plan_changes(current: &WatchState, desired: &WatchState, duration_ms: Option<u64>) -> Vec<ApplyAction> {
    let mut actions = Vec::new();

    if !desired.is_watched && desired.view_count == 0 {
        let offset = desired_offset(desired, duration_ms);
        let current_offset = current.view_offset_ms.filter(|o| *o > 0);
        let clean = !current.is_watched && current.view_count == 0;
        if !clean || (current_offset.is_some() && offset.is_none()) {
            actions.push(ApplyAction::MarkUnwatched);
            actions.extend(offset.map(ApplyAction::UpdateProgress));
        } else if offset.is_some() && offset != current_offset {
            actions.extend(offset.map(ApplyAction::UpdateProgress));
        }
    } else {
        let target = desired.view_count.max(1);
        let current_count = if current.is_watched {
            current.view_count.max(1)
        } else {
            current.view_count
        };
        let in_sync = current.is_watched && current_count == target;
        if !in_sync && current_count < target {
            let missing = target - current_count;
            actions.extend(std::iter::repeat(ApplyAction::MarkWatched).take(missing as usize));
        } else if !in_sync {
            actions.push(ApplyAction::MarkUnwatched);
            actions.extend(std::iter::repeat(ApplyAction::MarkWatched).take(target as usize));
        }

        if let Some(offset) = desired_offset(desired, duration_ms) {
            let current_offset = current.view_offset_ms.filter(|o| *o > 0);
            if !in_sync || current_offset != Some(offset) {
                actions.push(ApplyAction::UpdateProgress(offset));
            }
        }
    }

    plan_rating(current, desired, &mut actions);
    actions
}

/// Mutations for a series record. Its watched flag follows its episodes, which
/// carry their own records, so a series is only ever marked watched, never reset.
pub fn plan_show_changes(current: &WatchState, desired: &WatchState) -> Vec<ApplyAction> {
    let mut actions = Vec::new();
    if desired.is_watched && !current.is_watched {
        actions.push(ApplyAction::MarkWatched);
    }
    plan_rating(current, desired, &mut actions);
    actions
}

fn plan_rating(current: &WatchState, desired: &WatchState, actions: &mut Vec<ApplyAction>) {
    if let Some(rating) = desired.user_rating {
        let differs = current
            .user_rating
            .map_or(true, |existing| (existing - rating).abs() > RATING_EPSILON);
        if differs {
            actions.push(ApplyAction::Rate(rating));
        }
    }
}

/// Resume offset to restore, if any; the percentage wins when the duration is known.
fn desired_offset(desired: &WatchState, duration_ms: Option<u64>) -> Option<u64> {
    let from_percent = match (desired.view_percent, duration_ms) {
        (Some(percent), Some(duration)) if percent > 0.0 && duration > 0 => {
            Some((f64::from(percent) * duration as f64).round() as u64)
        }
        _ => None,
    };
    from_percent.or(desired.view_offset_ms).filter(|offset| *offset > 0)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Number of mutations performed (or that would be, in a dry run).
    Applied(usize),
    Unchanged,
    Failed(String),
}

/// Writes watch state to a destination server.
pub struct StateApplier<'a> {
    server: &'a dyn MediaServer,
    dry_run: bool,
}

impl<'a> StateApplier<'a> {
    pub fn new(server: &'a dyn MediaServer, dry_run: bool) -> Self {
        Self { server, dry_run }
    }

    /// Bring `item` to `desired` for `user`. Safe to repeat.
    pub async fn apply(&self, user: &ServerUser, item: &MediaItem, desired: &WatchState) -> ApplyOutcome {
        let current = match self.server.get_watch_state(user, item).await {
            Ok(state) => state,
            Err(e) => return ApplyOutcome::Failed(format!("reading current state: {}", e)),
        };

        let actions = match item.kind {
            MediaKind::Show => plan_show_changes(&current, desired),
            _ => plan_changes(&current, desired, item.duration_ms),
        };
        if actions.is_empty() {
            return ApplyOutcome::Unchanged;
        }

        if self.dry_run {
            info!(
                "[dry run] Would apply {:?} to {} for '{}'",
                actions,
                item.describe(),
                user.display_name()
            );
            return ApplyOutcome::Applied(actions.len());
        }

        for action in &actions {
            if let Err(e) = self.perform(user, item, *action).await {
                return ApplyOutcome::Failed(format!("{:?}: {}", action, e));
            }
        }
        debug!(
            "Applied {} changes to {} for '{}'",
            actions.len(),
            item.describe(),
            user.display_name()
        );
        ApplyOutcome::Applied(actions.len())
    }

    async fn perform(&self, user: &ServerUser, item: &MediaItem, action: ApplyAction) -> Result<(), SourceError> {
        match action {
            ApplyAction::MarkUnwatched => self.server.mark_unwatched(user, item).await,
            ApplyAction::MarkWatched => self.server.mark_watched(user, item).await,
            ApplyAction::UpdateProgress(offset) => self.server.update_progress(user, item, offset).await,
            ApplyAction::Rate(rating) => self.server.set_rating(user, item, rating).await,
        }
    }
}
