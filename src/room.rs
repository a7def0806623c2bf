//! Room lifecycle: creation, existence-checked joins, and teardown.

use std::collections::VecDeque;

use rand::Rng;
use tokio::sync::oneshot;
use tracing::debug;

/// Tracks which room (if any) the client is in, the shareable join URL, the
/// user-visible error, and in-flight room-existence checks.
///
/// Existence checks are correlated FIFO: each `check-room` request registers
/// a one-shot reply and each `room-exists` response resolves the oldest one,
/// so overlapping checks cannot race through a shared flag.
pub struct RoomController {
    room_id: Option<String>,
    share_url: Option<String>,
    joined: bool,
    error: Option<String>,
    share_url_base: String,
    pending_checks: VecDeque<oneshot::Sender<bool>>,
}

impl RoomController {
    pub fn new(share_url_base: String) -> Self {
        Self {
            room_id: None,
            share_url: None,
            joined: false,
            error: None,
            share_url_base,
            pending_checks: VecDeque::new(),
        }
    }

    /// Collision resistance is all that is asked of the id; uniqueness is the
    /// signaling server's problem.
    pub fn generate_room_id() -> String {
        let mut rng = rand::thread_rng();
        format!("{:06}", rng.gen_range(0..1_000_000u32))
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn share_url(&self) -> Option<&str> {
        self.share_url.as_deref()
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// A new create/join attempt clears any stale error.
    pub fn begin_action(&mut self) {
        self.error = None;
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn register_check(&mut self, reply: oneshot::Sender<bool>) {
        self.pending_checks.push_back(reply);
    }

    pub fn resolve_check(&mut self, exists: bool) {
        match self.pending_checks.pop_front() {
            Some(reply) => {
                let _ = reply.send(exists);
            }
            None => debug!("room-exists response with no check in flight"),
        }
    }

    pub fn mark_joined(&mut self, room_id: &str) {
        self.room_id = Some(room_id.to_owned());
        self.share_url = Some(format!("{}/{}", self.share_url_base, room_id));
        self.joined = true;
    }

    /// Back to the entry screen. Dropping pending check replies cancels their
    /// waiters. Safe to call when nothing is joined.
    pub fn reset(&mut self) {
        self.room_id = None;
        self.share_url = None;
        self.joined = false;
        self.pending_checks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> RoomController {
        RoomController::new("http://localhost:3000/room".to_owned())
    }

    #[test]
    fn generated_ids_are_six_digit_numeric() {
        for _ in 0..32 {
            let id = RoomController::generate_room_id();
            assert_eq!(id.len(), 6);
            assert!(id.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn checks_resolve_in_request_order() {
        let mut room = controller();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        room.register_check(tx1);
        room.register_check(tx2);

        room.resolve_check(true);
        room.resolve_check(false);
        assert_eq!(rx1.await, Ok(true));
        assert_eq!(rx2.await, Ok(false));
    }

    #[test]
    fn unmatched_response_is_ignored() {
        let mut room = controller();
        room.resolve_check(true);
    }

    #[tokio::test]
    async fn reset_cancels_pending_checks() {
        let mut room = controller();
        let (tx, rx) = oneshot::channel();
        room.register_check(tx);
        room.mark_joined("123456");
        room.reset();

        assert!(rx.await.is_err());
        assert!(!room.is_joined());
        assert!(room.room_id().is_none());
        assert!(room.share_url().is_none());
    }

    #[test]
    fn join_produces_share_url() {
        let mut room = controller();
        room.mark_joined("654321");
        assert_eq!(
            room.share_url(),
            Some("http://localhost:3000/room/654321")
        );
        assert!(room.is_joined());
    }

    #[test]
    fn new_action_clears_error() {
        let mut room = controller();
        room.set_error("room 1 not found");
        room.begin_action();
        assert!(room.error().is_none());
    }
}
