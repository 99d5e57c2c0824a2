use std::fmt;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::coordinator::CoordinatorEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Master,
    Follower,
    Inactive,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Master => "master",
            Role::Follower => "follower",
            Role::Inactive => "inactive",
        };
        f.write_str(name)
    }
}

pub trait SessionOwner: Send {
    fn connect(&mut self);
    fn disconnect(&mut self);
}

pub trait TabNotice: Send {
    fn show_duplicate_tab_notice(&mut self);
    fn hide_duplicate_tab_notice(&mut self);
}

#[derive(Debug, Default)]
pub struct LoggingSession;

impl SessionOwner for LoggingSession {
    fn connect(&mut self) {
        info!("upstream session connected");
    }

    fn disconnect(&mut self) {
        info!("upstream session disconnected");
    }
}

#[derive(Debug, Default)]
pub struct LoggingNotice;

impl TabNotice for LoggingNotice {
    fn show_duplicate_tab_notice(&mut self) {
        info!("app is open in another tab");
    }

    fn hide_duplicate_tab_notice(&mut self) {
        info!("duplicate tab notice cleared");
    }
}

pub struct RoleDispatcher {
    master: bool,
    active: bool,
    session: Box<dyn SessionOwner>,
    notice: Box<dyn TabNotice>,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl RoleDispatcher {
    pub fn new(
        session: Box<dyn SessionOwner>,
        notice: Box<dyn TabNotice>,
        events: broadcast::Sender<CoordinatorEvent>,
        active: bool,
    ) -> Self {
        Self {
            master: false,
            active,
            session,
            notice,
            events,
        }
    }

    pub fn role(&self) -> Role {
        if !self.active {
            Role::Inactive
        } else if self.master {
            Role::Master
        } else {
            Role::Follower
        }
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn promote(&mut self) -> bool {
        if self.master {
            debug!("promote ignored, already master");
            return false;
        }
        let before = self.role();
        self.master = true;
        self.session.connect();
        self.publish_change(before);
        true
    }

    pub fn demote(&mut self) -> bool {
        if !self.master {
            return false;
        }
        let before = self.role();
        self.master = false;
        self.session.disconnect();
        self.publish_change(before);
        true
    }

    pub fn mark_inactive(&mut self) -> bool {
        if !self.active {
            return false;
        }
        let before = self.role();
        self.active = false;
        self.notice.show_duplicate_tab_notice();
        self.publish_change(before);
        true
    }

    pub fn mark_active(&mut self) -> bool {
        if self.active {
            return false;
        }
        let before = self.role();
        self.active = true;
        self.notice.hide_duplicate_tab_notice();
        self.publish_change(before);
        true
    }

    fn publish_change(&self, from: Role) {
        let to = self.role();
        if from == to {
            return;
        }
        info!(%from, %to, "role changed");
        // No subscribers is fine.
        let _ = self.events.send(CoordinatorEvent::RoleChanged { from, to });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Calls(Arc<Mutex<Vec<&'static str>>>);

    impl Calls {
        fn take(&self) -> Vec<&'static str> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl SessionOwner for Calls {
        fn connect(&mut self) {
            self.0.lock().unwrap().push("connect");
        }

        fn disconnect(&mut self) {
            self.0.lock().unwrap().push("disconnect");
        }
    }

    impl TabNotice for Calls {
        fn show_duplicate_tab_notice(&mut self) {
            self.0.lock().unwrap().push("show");
        }

        fn hide_duplicate_tab_notice(&mut self) {
            self.0.lock().unwrap().push("hide");
        }
    }

    fn dispatcher() -> (RoleDispatcher, Calls, broadcast::Receiver<CoordinatorEvent>) {
        let calls = Calls::default();
        let (tx, rx) = broadcast::channel(16);
        let dispatcher =
            RoleDispatcher::new(Box::new(calls.clone()), Box::new(calls.clone()), tx, true);
        (dispatcher, calls, rx)
    }

    #[test]
    fn starts_inactive_without_showing_notice() {
        let calls = Calls::default();
        let (tx, mut rx) = broadcast::channel(16);
        let mut dispatcher =
            RoleDispatcher::new(Box::new(calls.clone()), Box::new(calls.clone()), tx, false);
        assert_eq!(dispatcher.role(), Role::Inactive);
        assert!(!dispatcher.is_active());

        assert!(dispatcher.promote());
        assert_eq!(dispatcher.role(), Role::Inactive);
        assert!(rx.try_recv().is_err());
        assert!(dispatcher.mark_active());
        assert_eq!(dispatcher.role(), Role::Master);
        assert_eq!(calls.take(), vec!["connect", "hide"]);
    }

    #[test]
    fn transitions_are_idempotent() {
        let (mut dispatcher, calls, _rx) = dispatcher();
        assert_eq!(dispatcher.role(), Role::Follower);

        assert!(dispatcher.promote());
        assert!(!dispatcher.promote());
        assert!(dispatcher.demote());
        assert!(!dispatcher.demote());
        assert!(dispatcher.mark_inactive());
        assert!(!dispatcher.mark_inactive());
        assert!(dispatcher.mark_active());
        assert!(!dispatcher.mark_active());

        assert_eq!(calls.take(), vec!["connect", "disconnect", "show", "hide"]);
    }

    #[test]
    fn inactivity_masks_mastership() {
        let (mut dispatcher, _calls, mut rx) = dispatcher();
        dispatcher.promote();
        dispatcher.mark_inactive();
        assert_eq!(dispatcher.role(), Role::Inactive);
        assert!(dispatcher.is_master());

        dispatcher.mark_active();
        assert_eq!(dispatcher.role(), Role::Master);

        let mut changes = Vec::new();
        while let Ok(CoordinatorEvent::RoleChanged { from, to }) = rx.try_recv() {
            changes.push((from, to));
        }
        assert_eq!(
            changes,
            vec![
                (Role::Follower, Role::Master),
                (Role::Master, Role::Inactive),
                (Role::Inactive, Role::Master),
            ]
        );
    }

    #[test]
    fn demote_while_inactive_keeps_role_but_disconnects() {
        let (mut dispatcher, calls, mut rx) = dispatcher();
        dispatcher.promote();
        dispatcher.mark_inactive();
        calls.take();
        while rx.try_recv().is_ok() {}

        assert!(dispatcher.demote());
        assert_eq!(calls.take(), vec!["disconnect"]);
        assert!(rx.try_recv().is_err());
    }
}
