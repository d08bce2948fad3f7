//! Presence tracking for collaborators in a session.
//!
//! Presence is best-effort: it is ephemeral, never replicated through the
//! CRDT, and losing a presence message only means a stale cursor until the
//! next update or timeout.

use crate::site::SiteId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Default idle time after which a silent collaborator is dropped.
pub const DEFAULT_PRESENCE_TIMEOUT_MS: u64 = 60_000;

/// A cursor or selection in visible-index coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    /// Index of the caret (or selection start)
    pub index: usize,
    /// Selection length; 0 for a plain caret
    pub length: usize,
}

impl CursorPosition {
    /// Create a cursor.
    pub fn new(index: usize, length: usize) -> Self {
        Self { index, length }
    }

    /// Check if this is a collapsed selection (caret only).
    pub fn is_collapsed(&self) -> bool {
        self.length == 0
    }
}

/// A collaborator as seen by the local session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationUser {
    /// User id (display identity)
    pub id: String,
    /// Site the user edits from
    pub site_id: SiteId,
    /// Last known cursor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    /// Assigned color (hex)
    #[serde(default)]
    pub color: String,
    /// Last activity timestamp (ms since epoch)
    #[serde(default)]
    pub last_active: u64,
    /// Whether the user is currently reachable
    #[serde(default = "default_online")]
    pub online: bool,
}

fn default_online() -> bool {
    true
}

impl CollaborationUser {
    /// Create an online user with no cursor.
    pub fn new(id: impl Into<String>, site_id: SiteId, color: impl Into<String>, now: u64) -> Self {
        Self {
            id: id.into(),
            site_id,
            cursor: None,
            color: color.into(),
            last_active: now,
            online: true,
        }
    }

    /// Copy of this user without the cursor, as announced in join/leave.
    pub fn without_cursor(&self) -> Self {
        Self {
            cursor: None,
            ..self.clone()
        }
    }

    /// Check if the user has been silent longer than `timeout_ms`.
    pub fn is_idle(&self, now: u64, timeout_ms: u64) -> bool {
        now.saturating_sub(self.last_active) > timeout_ms
    }
}

/// Roster of remote collaborators keyed by site.
#[derive(Clone, Debug)]
pub struct PresenceTracker {
    /// Users by site, sorted for stable iteration
    users: BTreeMap<SiteId, CollaborationUser>,
    /// Colors handed out so far; kept across leave so a rejoin looks the same
    color_assignments: HashMap<SiteId, String>,
    /// Palette for new users
    palette: Vec<String>,
    /// Next palette slot
    next_color_index: usize,
    /// Idle threshold in milliseconds
    timeout_ms: u64,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    /// Create a tracker with the default idle threshold.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PRESENCE_TIMEOUT_MS)
    }

    /// Create a tracker with a custom idle threshold.
    pub fn with_timeout(timeout_ms: u64) -> Self {
        Self {
            users: BTreeMap::new(),
            color_assignments: HashMap::new(),
            palette: default_colors(),
            next_color_index: 0,
            timeout_ms,
        }
    }

    /// Get the idle threshold.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Add or refresh a user.
    ///
    /// A user arriving without a color gets one from the palette. Returns
    /// true if the site was not in the roster before.
    pub fn join(&mut self, mut user: CollaborationUser) -> bool {
        if user.color.is_empty() {
            user.color = self.assign_color(&user.site_id);
        } else {
            self.color_assignments
                .entry(user.site_id.clone())
                .or_insert_with(|| user.color.clone());
        }
        user.online = true;

        match self.users.get_mut(&user.site_id) {
            Some(existing) => {
                // Keep the last known cursor across a re-announce
                let cursor = user.cursor.or(existing.cursor);
                *existing = CollaborationUser { cursor, ..user };
                false
            }
            None => {
                self.users.insert(user.site_id.clone(), user);
                true
            }
        }
    }

    /// Remove a user, returning the removed record.
    pub fn leave(&mut self, site: &SiteId) -> Option<CollaborationUser> {
        self.users.remove(site)
    }

    /// Record a cursor move. Returns false for unknown sites.
    pub fn update_cursor(&mut self, site: &SiteId, cursor: CursorPosition, now: u64) -> bool {
        match self.users.get_mut(site) {
            Some(user) => {
                user.cursor = Some(cursor);
                user.last_active = user.last_active.max(now);
                user.online = true;
                true
            }
            None => false,
        }
    }

    /// Refresh a user's activity timestamp.
    pub fn touch(&mut self, site: &SiteId, now: u64) {
        if let Some(user) = self.users.get_mut(site) {
            user.last_active = user.last_active.max(now);
            user.online = true;
        }
    }

    /// Drop users idle longer than the threshold and return their sites.
    pub fn expire(&mut self, now: u64) -> Vec<SiteId> {
        let timeout_ms = self.timeout_ms;
        let idle: Vec<SiteId> = self
            .users
            .values()
            .filter(|user| user.is_idle(now, timeout_ms))
            .map(|user| user.site_id.clone())
            .collect();

        for site in &idle {
            self.users.remove(site);
        }
        idle
    }

    /// Mark every user offline (used when the local transport drops).
    pub fn mark_all_offline(&mut self) {
        for user in self.users.values_mut() {
            user.online = false;
        }
    }

    /// Get a user's record.
    pub fn get(&self, site: &SiteId) -> Option<&CollaborationUser> {
        self.users.get(site)
    }

    /// All users in site order.
    pub fn users(&self) -> Vec<&CollaborationUser> {
        self.users.values().collect()
    }

    /// Users currently marked online.
    pub fn online_users(&self) -> Vec<&CollaborationUser> {
        self.users.values().filter(|user| user.online).collect()
    }

    /// Number of users in the roster.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Check if the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Color for a site, assigning the next palette entry on first use.
    pub fn assign_color(&mut self, site: &SiteId) -> String {
        if let Some(color) = self.color_assignments.get(site) {
            return color.clone();
        }

        let color = self.palette[self.next_color_index % self.palette.len()].clone();
        self.next_color_index = (self.next_color_index + 1) % self.palette.len();

        self.color_assignments.insert(site.clone(), color.clone());
        color
    }

    /// Remove everyone (colors are kept).
    pub fn clear(&mut self) {
        self.users.clear();
    }
}

/// Default color palette for collaborator cursors
pub fn default_colors() -> Vec<String> {
    vec![
        "#E91E63".into(), // Pink
        "#9C27B0".into(), // Purple
        "#3F51B5".into(), // Indigo
        "#2196F3".into(), // Blue
        "#00BCD4".into(), // Cyan
        "#4CAF50".into(), // Green
        "#FF9800".into(), // Orange
        "#795548".into(), // Brown
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(site: &str, now: u64) -> CollaborationUser {
        CollaborationUser::new(format!("user-{site}"), SiteId::new(site), "", now)
    }

    #[test]
    fn test_join_assigns_round_robin_colors() {
        let mut tracker = PresenceTracker::new();
        assert!(tracker.join(user("a", 0)));
        assert!(tracker.join(user("b", 0)));

        let colors = default_colors();
        assert_eq!(tracker.get(&SiteId::new("a")).unwrap().color, colors[0]);
        assert_eq!(tracker.get(&SiteId::new("b")).unwrap().color, colors[1]);
    }

    #[test]
    fn test_color_is_stable_across_rejoin() {
        let mut tracker = PresenceTracker::new();
        tracker.join(user("a", 0));
        let first = tracker.get(&SiteId::new("a")).unwrap().color.clone();

        tracker.leave(&SiteId::new("a"));
        tracker.join(user("b", 0));
        tracker.join(user("a", 0));

        assert_eq!(tracker.get(&SiteId::new("a")).unwrap().color, first);
    }

    #[test]
    fn test_announced_color_is_kept() {
        let mut tracker = PresenceTracker::new();
        let mut announced = user("a", 0);
        announced.color = "#123456".into();
        tracker.join(announced);

        assert_eq!(tracker.get(&SiteId::new("a")).unwrap().color, "#123456");
    }

    #[test]
    fn test_rejoin_is_not_new_and_keeps_cursor() {
        let mut tracker = PresenceTracker::new();
        tracker.join(user("a", 0));
        tracker.update_cursor(&SiteId::new("a"), CursorPosition::new(4, 2), 10);

        assert!(!tracker.join(user("a", 20)));
        let record = tracker.get(&SiteId::new("a")).unwrap();
        assert_eq!(record.cursor, Some(CursorPosition::new(4, 2)));
        assert_eq!(record.last_active, 20);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_update_cursor_unknown_site() {
        let mut tracker = PresenceTracker::new();
        assert!(!tracker.update_cursor(&SiteId::new("ghost"), CursorPosition::default(), 0));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_expire_idle_users() {
        let mut tracker = PresenceTracker::with_timeout(1_000);
        tracker.join(user("a", 0));
        tracker.join(user("b", 0));
        tracker.touch(&SiteId::new("b"), 900);

        let expired = tracker.expire(1_500);
        assert_eq!(expired, vec![SiteId::new("a")]);
        assert!(tracker.get(&SiteId::new("a")).is_none());
        assert!(tracker.get(&SiteId::new("b")).is_some());
    }

    #[test]
    fn test_online_users() {
        let mut tracker = PresenceTracker::new();
        tracker.join(user("a", 0));
        tracker.join(user("b", 0));
        tracker.mark_all_offline();
        tracker.touch(&SiteId::new("b"), 5);

        let online: Vec<&str> = tracker
            .online_users()
            .iter()
            .map(|u| u.site_id.as_str())
            .collect();
        assert_eq!(online, vec!["b"]);
        assert_eq!(tracker.users().len(), 2);
    }

    #[test]
    fn test_user_serialization_omits_cursor() {
        let mut u = user("a", 7);
        u.cursor = Some(CursorPosition::new(1, 0));
        let json = serde_json::to_value(u.without_cursor()).unwrap();

        assert_eq!(json["siteId"], "a");
        assert_eq!(json["lastActive"], 7);
        assert!(json.get("cursor").is_none());
    }
}
