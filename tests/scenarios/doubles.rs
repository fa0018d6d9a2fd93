//! Collaborators the scenarios drive or inspect
//!
//! Each shares its state through `Rc<RefCell<_>>`: one clone goes into
//! the bridge, the other stays with the test.

use bridgecore::dataplane::{Announcement, CarrierSource, LearningPacketSender, Revalidator, Tag};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Records every tag the bridge asks to revalidate
#[derive(Default, Clone)]
pub struct RecordingRevalidator {
    tags: Rc<RefCell<Vec<Tag>>>,
}

impl RecordingRevalidator {
    pub fn take(&self) -> Vec<Tag> {
        std::mem::take(&mut *self.tags.borrow_mut())
    }
}

impl Revalidator for RecordingRevalidator {
    fn revalidate(&mut self, tag: Tag) {
        self.tags.borrow_mut().push(tag);
    }

    fn revalidate_all(&mut self) {}
}

/// Records learning packets instead of sending them
#[derive(Default, Clone)]
pub struct RecordingSender {
    sent: Rc<RefCell<Vec<Announcement>>>,
}

impl RecordingSender {
    pub fn take(&self) -> Vec<Announcement> {
        std::mem::take(&mut *self.sent.borrow_mut())
    }
}

impl LearningPacketSender for RecordingSender {
    fn send(&mut self, announcement: &Announcement) -> bridgecore::Result<()> {
        self.sent.borrow_mut().push(*announcement);
        Ok(())
    }
}

/// Link state set by the test; slaves never set are up
#[derive(Default, Clone)]
pub struct ScriptedCarrier {
    links: Rc<RefCell<HashMap<String, bool>>>,
}

impl ScriptedCarrier {
    pub fn set(&self, slave: &str, up: bool) {
        self.links.borrow_mut().insert(slave.to_string(), up);
    }
}

impl CarrierSource for ScriptedCarrier {
    fn get_carrier(&self, slave: &str) -> bool {
        self.links.borrow().get(slave).copied().unwrap_or(true)
    }

    fn get_miimon(&self, slave: &str) -> bool {
        self.get_carrier(slave)
    }
}
