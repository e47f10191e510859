//! Presence and activity tracking.
//!
//! Tracks who is on the channel, what each peer has selected, and which
//! annotations a peer has recently touched.
//!
//! ## Architecture
//!
//! ```text
//! membership snapshot ──► sync_users() ──► SyncEvent::Presence
//!
//! SelectEvent ──► handle_select() ──┬─► SyncEvent::SelectionChange
//!                                   └─► SyncEvent::OffPageActivity  (foreign source)
//!
//! BroadcastMessage ──► notify_activity() ──┬─► SyncEvent::Activity
//!                                          └─► SyncEvent::OffPageActivity
//! ```
//!
//! Peers working on a different document source never touch local state;
//! they are reported as off-page activity so the host can show cross-page
//! awareness.

use std::sync::Arc;
use std::time::{Duration, Instant};

use marginalia_core::User;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::events::SyncEvent;
use crate::protocol::{Peer, SelectEvent};

// ───────────────────────────────────────────────────────────────────
// Appearance
// ───────────────────────────────────────────────────────────────────

/// RGBA color, components in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    /// Stable, saturated color derived from a user id.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// CSS-style `#rrggbb`.
    pub fn to_hex(&self) -> String {
        let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// How a peer is drawn in the host UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appearance {
    pub label: String,
    pub color: Color,
}

impl Appearance {
    pub fn for_user(user: &User) -> Self {
        Self {
            label: user.name.clone().unwrap_or_else(|| "Anonymous".to_string()),
            color: Color::from_uuid(user.id),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// One connected peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentUser {
    pub presence_key: String,
    pub user: User,
    pub appearance: Appearance,
}

impl PresentUser {
    pub fn from_peer(peer: &Peer) -> Self {
        Self {
            presence_key: peer.presence_key.clone(),
            user: peer.user.clone(),
            appearance: Appearance::for_user(&peer.user),
        }
    }
}

#[derive(Debug, Clone)]
struct PeerState {
    present: PresentUser,
    selection: Option<Vec<Uuid>>,
    active_on: Vec<Uuid>,
    last_active: Option<Instant>,
}

impl PeerState {
    fn new(peer: &Peer) -> Self {
        Self {
            present: PresentUser::from_peer(peer),
            selection: None,
            active_on: Vec::new(),
            last_active: None,
        }
    }
}

pub struct PresenceTracker {
    local_key: String,
    config: Arc<SyncConfig>,
    /// In join order; includes the local peer once the channel reports it.
    peers: Vec<PeerState>,
}

impl PresenceTracker {
    pub fn new(local_key: impl Into<String>, config: Arc<SyncConfig>) -> Self {
        Self {
            local_key: local_key.into(),
            config,
            peers: Vec::new(),
        }
    }

    /// Replaces the membership with a channel snapshot.
    ///
    /// Returns a presence event when someone joined, left or changed
    /// identity. Selection and activity of peers who stay are kept.
    pub fn sync_users(&mut self, snapshot: &[Peer]) -> Option<SyncEvent> {
        let mut changed = snapshot.len() != self.peers.len();
        let mut next = Vec::with_capacity(snapshot.len());

        for peer in snapshot {
            match self.peers.iter().position(|p| p.present.presence_key == peer.presence_key) {
                Some(idx) => {
                    let mut state = self.peers[idx].clone();
                    if state.present.user != peer.user {
                        state.present = PresentUser::from_peer(peer);
                        changed = true;
                    }
                    next.push(state);
                }
                None => {
                    log::debug!("peer joined: {}", peer.presence_key);
                    next.push(PeerState::new(peer));
                    changed = true;
                }
            }
        }

        self.peers = next;
        changed.then(|| SyncEvent::Presence(self.present_users()))
    }

    pub fn present_users(&self) -> Vec<PresentUser> {
        self.peers.iter().map(|p| p.present.clone()).collect()
    }

    pub fn get(&self, presence_key: &str) -> Option<&PresentUser> {
        self.state(presence_key).map(|p| &p.present)
    }

    /// Looks up a present peer's identity by user id.
    pub fn find_user(&self, id: Uuid) -> Option<User> {
        self.peers
            .iter()
            .find(|p| p.present.user.id == id)
            .map(|p| p.present.user.clone())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn selection(&self, presence_key: &str) -> Option<&[Uuid]> {
        self.state(presence_key)?.selection.as_deref()
    }

    /// Annotations the peer touched within `within`.
    pub fn active_annotations(&self, presence_key: &str, within: Duration) -> Vec<Uuid> {
        match self.state(presence_key) {
            Some(PeerState { active_on, last_active: Some(at), .. }) if at.elapsed() <= within => {
                active_on.clone()
            }
            _ => Vec::new(),
        }
    }

    /// Inbound selection update from the channel.
    pub fn handle_select(&mut self, event: &SelectEvent) -> Option<SyncEvent> {
        if event.from.presence_key == self.local_key {
            return None;
        }
        if !self.config.accepts_source(event.source.as_deref()) {
            log::debug!("selection from {} on foreign source {:?}", event.from.presence_key, event.source);
            return Some(SyncEvent::OffPageActivity {
                source: event.source.clone(),
                user: event.from.user.clone(),
            });
        }
        let state = self.state_or_insert(&event.from);
        state.selection = event.ids.clone();
        Some(SyncEvent::SelectionChange {
            from: state.present.clone(),
            ids: event.ids.clone(),
        })
    }

    /// Attributes a remote change to its sender.
    pub fn notify_activity(&mut self, from: &Peer, annotations: Vec<Uuid>, source: Option<&str>) -> Option<SyncEvent> {
        if !self.config.accepts_source(source) {
            return Some(SyncEvent::OffPageActivity {
                source: source.map(String::from),
                user: from.user.clone(),
            });
        }
        if annotations.is_empty() {
            return None;
        }
        let state = self.state_or_insert(from);
        state.active_on = annotations.clone();
        state.last_active = Some(Instant::now());
        Some(SyncEvent::Activity {
            from: state.present.clone(),
            annotations,
        })
    }

    /// Selection message for a local selection change.
    pub fn local_select_event(&self, local: Peer, ids: Vec<Uuid>) -> SelectEvent {
        SelectEvent {
            from: local,
            ids: (!ids.is_empty()).then_some(ids),
            source: self.config.source.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    fn state(&self, presence_key: &str) -> Option<&PeerState> {
        self.peers.iter().find(|p| p.present.presence_key == presence_key)
    }

    /// Peers can be heard from before their join shows up in a snapshot.
    fn state_or_insert(&mut self, peer: &Peer) -> &mut PeerState {
        let idx = match self.peers.iter().position(|p| p.present.presence_key == peer.presence_key) {
            Some(idx) => idx,
            None => {
                self.peers.push(PeerState::new(peer));
                self.peers.len() - 1
            }
        };
        &mut self.peers[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(source: Option<&str>) -> PresenceTracker {
        let mut config = SyncConfig::new("doc", Uuid::new_v4());
        config.source = source.map(String::from);
        PresenceTracker::new("local", Arc::new(config))
    }

    fn peer(key: &str, name: &str) -> Peer {
        Peer::new(key, User::named(Uuid::new_v4(), name))
    }

    // ── Appearance tests ─────────────────────────────────────────

    #[test]
    fn test_color_from_uuid_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(Color::from_uuid(id), Color::from_uuid(id));
    }

    #[test]
    fn test_color_in_range() {
        let c = Color::from_uuid(Uuid::new_v4());
        for component in [c.r, c.g, c.b] {
            assert!((0.0..=1.0).contains(&component));
        }
        assert_eq!(c.to_hex().len(), 7);
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_anonymous_label() {
        let appearance = Appearance::for_user(&User::new(Uuid::new_v4()));
        assert_eq!(appearance.label, "Anonymous");
    }

    // ── Membership tests ─────────────────────────────────────────

    #[test]
    fn test_sync_users_join_and_leave() {
        let mut presence = tracker(None);
        let alice = peer("a", "Alice");
        let bob = peer("b", "Bob");

        match presence.sync_users(&[alice.clone(), bob.clone()]) {
            Some(SyncEvent::Presence(users)) => assert_eq!(users.len(), 2),
            other => panic!("expected presence, got {other:?}"),
        }

        // Same membership again: nothing to report
        assert!(presence.sync_users(&[alice.clone(), bob.clone()]).is_none());

        match presence.sync_users(&[bob.clone()]) {
            Some(SyncEvent::Presence(users)) => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].presence_key, "b");
            }
            other => panic!("expected presence, got {other:?}"),
        }
    }

    #[test]
    fn test_sync_users_keeps_selection() {
        let mut presence = tracker(None);
        let alice = peer("a", "Alice");
        presence.sync_users(&[alice.clone()]);

        let ids = vec![Uuid::new_v4()];
        presence.handle_select(&SelectEvent { from: alice.clone(), ids: Some(ids.clone()), source: None });
        presence.sync_users(&[alice.clone(), peer("b", "Bob")]);

        assert_eq!(presence.selection("a"), Some(ids.as_slice()));
    }

    #[test]
    fn test_find_user() {
        let mut presence = tracker(None);
        let alice = peer("a", "Alice");
        presence.sync_users(&[alice.clone()]);

        assert_eq!(presence.find_user(alice.user.id), Some(alice.user));
        assert!(presence.find_user(Uuid::new_v4()).is_none());
    }

    // ── Selection tests ──────────────────────────────────────────

    #[test]
    fn test_select_from_peer() {
        let mut presence = tracker(Some("docA"));
        let alice = peer("a", "Alice");
        let ids = vec![Uuid::new_v4()];

        let event = presence.handle_select(&SelectEvent {
            from: alice.clone(),
            ids: Some(ids.clone()),
            source: Some("docA".into()),
        });
        match event {
            Some(SyncEvent::SelectionChange { from, ids: selected }) => {
                assert_eq!(from.presence_key, "a");
                assert_eq!(selected, Some(ids));
            }
            other => panic!("expected selection change, got {other:?}"),
        }
    }

    #[test]
    fn test_own_select_ignored() {
        let mut presence = tracker(None);
        let me = peer("local", "Me");
        assert!(presence.handle_select(&SelectEvent { from: me, ids: None, source: None }).is_none());
        assert_eq!(presence.peer_count(), 0);
    }

    #[test]
    fn test_select_from_other_page_is_off_page() {
        let mut presence = tracker(Some("docA"));
        let alice = peer("a", "Alice");

        let event = presence.handle_select(&SelectEvent {
            from: alice.clone(),
            ids: Some(vec![Uuid::new_v4()]),
            source: Some("docB".into()),
        });
        match event {
            Some(SyncEvent::OffPageActivity { source, user }) => {
                assert_eq!(source.as_deref(), Some("docB"));
                assert_eq!(user, alice.user);
            }
            other => panic!("expected off-page activity, got {other:?}"),
        }
        assert!(presence.selection("a").is_none());
    }

    #[test]
    fn test_local_select_event() {
        let presence = tracker(Some("docA"));
        let me = peer("local", "Me");

        let cleared = presence.local_select_event(me.clone(), Vec::new());
        assert_eq!(cleared.ids, None);
        assert_eq!(cleared.source.as_deref(), Some("docA"));

        let id = Uuid::new_v4();
        let selected = presence.local_select_event(me, vec![id]);
        assert_eq!(selected.ids, Some(vec![id]));
    }

    // ── Activity tests ───────────────────────────────────────────

    #[test]
    fn test_activity_marks_peer() {
        let mut presence = tracker(None);
        let alice = peer("a", "Alice");
        presence.sync_users(&[alice.clone()]);

        let touched = vec![Uuid::new_v4()];
        let event = presence.notify_activity(&alice, touched.clone(), None);
        assert!(matches!(event, Some(SyncEvent::Activity { ref annotations, .. }) if *annotations == touched));
        assert_eq!(presence.active_annotations("a", Duration::from_secs(5)), touched);
        assert!(presence.active_annotations("b", Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn test_activity_without_annotations_is_quiet() {
        let mut presence = tracker(Some("docA"));
        let alice = peer("a", "Alice");
        assert!(presence.notify_activity(&alice, Vec::new(), Some("docA")).is_none());
    }

    #[test]
    fn test_activity_on_other_page() {
        let mut presence = tracker(Some("docA"));
        let alice = peer("a", "Alice");

        let event = presence.notify_activity(&alice, Vec::new(), Some("docB"));
        assert!(matches!(
            event,
            Some(SyncEvent::OffPageActivity { source: Some(ref s), .. }) if s == "docB"
        ));
        assert_eq!(presence.peer_count(), 0);
    }

    #[test]
    fn test_clear() {
        let mut presence = tracker(None);
        presence.sync_users(&[peer("a", "Alice")]);
        presence.clear();
        assert_eq!(presence.peer_count(), 0);
    }
}
