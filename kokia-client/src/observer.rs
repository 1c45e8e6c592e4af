//! セッションイベントの購読

use crate::session::Session;
use crate::target::TargetId;
use crate::thread::{StopInfo, WeakThread};
use std::rc::Rc;

/// 購読者に配られるイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ThreadStarting(WeakThread),
    ThreadExiting(WeakThread),
    /// ユーザーに見せるべき停止
    ThreadStopped { thread: WeakThread, stop: StopInfo },
    ProcessExited { target: TargetId, process_koid: u64, return_code: i64 },
    ModulesChanged { process_koid: u64 },
}

pub trait SessionObserver {
    fn on_event(&self, session: &mut Session, event: &SessionEvent);
}

/// 購読の識別子
///
/// スロットが再利用されても世代が違えば別の購読として扱います。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    index: usize,
    generation: u32,
}

struct Slot {
    generation: u32,
    observer: Option<Rc<dyn SessionObserver>>,
}

#[derive(Default)]
pub struct ObserverRegistry {
    slots: Vec<Slot>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: Rc<dyn SessionObserver>) -> SubscriptionId {
        if let Some(index) = self.slots.iter().position(|s| s.observer.is_none()) {
            let slot = &mut self.slots[index];
            slot.observer = Some(observer);
            return SubscriptionId { index, generation: slot.generation };
        }
        self.slots.push(Slot { generation: 0, observer: Some(observer) });
        SubscriptionId { index: self.slots.len() - 1, generation: 0 }
    }

    /// 購読を解除する。古いIDなら何もしない
    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        match self.slots.get_mut(id.index) {
            Some(slot) if slot.generation == id.generation && slot.observer.is_some() => {
                slot.observer = None;
                slot.generation = slot.generation.wrapping_add(1);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Rc<dyn SessionObserver>> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.observer.clone())
    }

    /// 通知を始める時点の購読一覧
    pub fn snapshot(&self) -> Vec<SubscriptionId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.observer.is_some())
            .map(|(index, slot)| SubscriptionId { index, generation: slot.generation })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.observer.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
