//! クライアントのメッセージループ
//!
//! 応答のコールバックや後始末はすべてタスクとしてここに積まれ、
//! `Session::run_until_idle` が順に実行します。要求を出した呼び出しの中で
//! コールバックが同期的に呼ばれることはありません。

use crate::session::Session;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub type Task = Box<dyn FnOnce(&mut Session)>;

/// タスクキューへの共有ハンドル
#[derive(Clone, Default)]
pub struct MessageLoop {
    queue: Rc<RefCell<VecDeque<Task>>>,
}

impl MessageLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, task: impl FnOnce(&mut Session) + 'static) {
        self.queue.borrow_mut().push_back(Box::new(task));
    }

    pub fn pop(&self) -> Option<Task> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

impl std::fmt::Debug for MessageLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLoop").field("pending", &self.len()).finish()
    }
}
