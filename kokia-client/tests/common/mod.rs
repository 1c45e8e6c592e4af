//! モックの RemoteApi を使ったセッションの準備

#![allow(dead_code)]

use kokia_client::*;
use kokia_wire::*;
use std::cell::RefCell;
use std::rc::Rc;

pub const PID: u64 = 10;
pub const TID: u64 = 11;

/// 受け取ったイベントを記録する購読者
#[derive(Default)]
pub struct Recorder {
    pub events: RefCell<Vec<SessionEvent>>,
}

impl Recorder {
    pub fn stops(&self) -> Vec<StopInfo> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::ThreadStopped { stop, .. } => Some(stop.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl SessionObserver for Recorder {
    fn on_event(&self, _session: &mut Session, event: &SessionEvent) {
        self.events.borrow_mut().push(event.clone());
    }
}

pub struct Fixture {
    pub session: Session,
    pub mock: Rc<RefCell<MockState>>,
    pub recorder: Rc<Recorder>,
    pub target: TargetId,
}

pub fn record(state: ThreadState, frames: &[(u64, u64, u64)]) -> ThreadRecord {
    ThreadRecord {
        process_koid: PID,
        thread_koid: TID,
        name: "main".into(),
        state,
        stack_amount: if frames.is_empty() { StackAmount::None } else { StackAmount::Minimal },
        frames: frames.iter().map(|&(ip, sp, bp)| StackFrame::new(ip, sp, bp)).collect(),
    }
}

impl Fixture {
    /// 接続とアタッチを済ませ、スレッドを1つ登録する
    pub fn new() -> Self {
        let message_loop = MessageLoop::new();
        let api = MockRemoteApi::new(message_loop.clone());
        let mock = api.state();
        mock.borrow_mut().process_name = "app".into();

        let mut session = Session::new(Box::new(api), message_loop, SessionConfig::default())
            .with_symbols(Box::new(NoSymbols));
        let recorder = Rc::new(Recorder::default());
        session.add_observer(recorder.clone());

        session.connect(|_, result| assert_eq!(result, Ok(Arch::X64)));
        let target = session.create_target();
        session.attach(target, PID, |_, result| assert_eq!(result, Ok(PID)));
        session.run_until_idle();
        session.handle_notification(Notification::ThreadStarting(NotifyThreadStarting {
            record: record(ThreadState::Suspended, &[]),
        }));
        session.run_until_idle();
        recorder.clear();

        Self { session, mock, recorder, target }
    }

    pub fn weak(&self) -> WeakThread {
        self.session.find_thread(PID, TID).expect("thread").weak()
    }

    /// スレッドが例外で止まったことを通知する
    pub fn stop(
        &mut self,
        exception_type: ExceptionType,
        frames: &[(u64, u64, u64)],
        hits: &[(u32, u32)],
    ) {
        self.session.handle_notification(Notification::Exception(NotifyException {
            process_koid: PID,
            thread: record(ThreadState::Suspended, frames),
            exception_type,
            hit_breakpoints: hits
                .iter()
                .map(|&(breakpoint_id, hit_count)| BreakpointStats {
                    breakpoint_id,
                    hit_count,
                    should_delete: false,
                })
                .collect(),
        }));
        self.session.run_until_idle();
    }

    /// コントローラを付けて再開する
    pub fn continue_with(&mut self, controller: Box<dyn ThreadController>) -> Result<()> {
        let result = Rc::new(RefCell::new(None));
        let out = result.clone();
        let weak = self.weak();
        self.session
            .continue_with(&weak, controller, move |_, r| *out.borrow_mut() = Some(r));
        self.session.run_until_idle();
        let r = result.borrow_mut().take().expect("callback not called");
        r
    }

    pub fn resume_count(&self) -> usize {
        self.mock.borrow().resume_count
    }

    pub fn last_resume(&self) -> ResumeRequest {
        self.mock.borrow().last_resume.clone().expect("no resume")
    }
}
