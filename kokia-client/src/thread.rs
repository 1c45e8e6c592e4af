//! クライアント側のスレッド

use crate::controller::ThreadController;
use crate::stack::{Frame, Stack};
use kokia_wire::{ExceptionType, StackAmount, Stop, ThreadRecord, ThreadState};

/// スレッドへの弱い参照
///
/// スレッドが作り直されると世代が変わるので、非同期コールバックは
/// `Session::thread` で引き直して生存を確認します。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakThread {
    pub process_koid: u64,
    pub thread_koid: u64,
    pub generation: u64,
}

/// 直近の停止の情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopInfo {
    pub exception_type: ExceptionType,
    /// ヒットしたブレークポイントのID（内部ブレークポイントを含む）
    pub hit_breakpoints: Vec<u32>,
    /// 再開時に使う停止範囲（ユーザーのブレークポイントで最も強いもの）
    pub stop_mode: Stop,
}

pub struct Thread {
    process_koid: u64,
    koid: u64,
    name: String,
    state: ThreadState,
    generation: u64,
    stack: Stack,
    pub(crate) controller: Option<Box<dyn ThreadController>>,
    pub(crate) last_stop: Option<StopInfo>,
}

impl Thread {
    pub(crate) fn new(record: &ThreadRecord, generation: u64) -> Self {
        let mut thread = Self {
            process_koid: record.process_koid,
            koid: record.thread_koid,
            name: String::new(),
            state: ThreadState::Running,
            generation,
            stack: Stack::new(),
            controller: None,
            last_stop: None,
        };
        thread.update(record);
        thread
    }

    /// レコードの内容で状態とフレームを更新する
    pub(crate) fn update(&mut self, record: &ThreadRecord) {
        self.name = record.name.clone();
        self.state = record.state;
        let frames = record.frames.iter().map(Frame::from).collect();
        self.stack.set_frames(frames, record.stack_amount == StackAmount::Full);
    }

    pub fn process_koid(&self) -> u64 {
        self.process_koid
    }

    pub fn koid(&self) -> u64 {
        self.koid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.state, ThreadState::Suspended | ThreadState::Blocked)
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub(crate) fn stack_mut(&mut self) -> &mut Stack {
        &mut self.stack
    }

    pub fn ip(&self) -> Option<u64> {
        self.stack.frame(0).map(|f| f.ip)
    }

    pub fn last_stop(&self) -> Option<&StopInfo> {
        self.last_stop.as_ref()
    }

    /// 現在のコントローラの名前
    pub fn controller_name(&self) -> Option<&'static str> {
        self.controller.as_ref().map(|c| c.name())
    }

    pub fn weak(&self) -> WeakThread {
        WeakThread {
            process_koid: self.process_koid,
            thread_koid: self.koid,
            generation: self.generation,
        }
    }

    /// 再開したのでフレームを捨てる
    pub(crate) fn mark_running(&mut self) {
        self.state = ThreadState::Running;
        self.stack.clear_frames();
        self.last_stop = None;
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("process_koid", &self.process_koid)
            .field("koid", &self.koid)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("controller", &self.controller_name())
            .finish()
    }
}
