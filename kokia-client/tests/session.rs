//! セッションの状態管理（モックの RemoteApi を使用）

mod common;

use common::*;
use kokia_client::*;
use kokia_wire::*;
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn test_connect_rejects_version_and_arch() {
    for (version, arch, expected) in [
        (
            PROTOCOL_VERSION + 1,
            Arch::X64,
            Error::VersionMismatch { local: PROTOCOL_VERSION, remote: PROTOCOL_VERSION + 1 },
        ),
        (PROTOCOL_VERSION, Arch::Unknown, Error::UnsupportedArch(Arch::Unknown)),
    ] {
        let message_loop = MessageLoop::new();
        let api = MockRemoteApi::new(message_loop.clone());
        let state = api.state();
        state.borrow_mut().version = Some(version);
        state.borrow_mut().arch = Some(arch);
        let mut session = Session::new(Box::new(api), message_loop, SessionConfig::default());
        let result = Rc::new(RefCell::new(None));
        let out = result.clone();
        session.connect(move |_, r| *out.borrow_mut() = Some(r));
        // コールバックは呼び出しの中では走らない
        assert!(result.borrow().is_none());
        session.run_until_idle();
        assert_eq!(result.borrow_mut().take(), Some(Err(expected)));
        assert!(!session.is_connected());
    }
}

#[test]
fn test_attach_and_target_state() {
    let f = Fixture::new();
    let target = f.session.target(f.target).unwrap();
    let process = target.process().unwrap();
    assert_eq!(process.koid(), PID);
    assert_eq!(process.name(), "app");
    assert_eq!(process.threads().count(), 1);
    assert_eq!(f.session.arch(), Some(Arch::X64));
}

#[test]
fn test_second_attach_is_bad_state() {
    let mut f = Fixture::new();
    let result = Rc::new(RefCell::new(None));
    let out = result.clone();
    let target = f.target;
    f.session.attach(target, PID, move |_, r| *out.borrow_mut() = Some(r));
    f.session.run_until_idle();
    assert_eq!(
        result.borrow_mut().take(),
        Some(Err(Error::BadState("target already has a process")))
    );
}

#[test]
fn test_process_exit_resets_target() {
    let mut f = Fixture::new();
    f.session.handle_notification(Notification::ProcessExiting(NotifyProcessExiting {
        process_koid: PID,
        return_code: 3,
    }));
    assert!(f.session.target(f.target).unwrap().is_idle());
    assert_eq!(
        f.recorder.events.borrow().last(),
        Some(&SessionEvent::ProcessExited { target: f.target, process_koid: PID, return_code: 3 })
    );
}

#[test]
fn test_kill_and_launch_again() {
    let mut f = Fixture::new();
    let target = f.target;
    f.session.kill(target, |_, r| r.unwrap());
    f.session.run_until_idle();
    assert!(f.session.target(target).unwrap().is_idle());

    f.mock.borrow_mut().process_koid = 77;
    f.session
        .launch(target, vec!["/bin/app".into()], |_, r| assert_eq!(r, Ok(77)));
    assert!(matches!(f.session.target(target).unwrap().state(), TargetState::Starting));
    f.session.run_until_idle();
    assert_eq!(f.session.target(target).unwrap().process().unwrap().koid(), 77);
    let requests = f.mock.borrow().requests.clone();
    assert!(requests.ends_with(&[MsgType::Launch, MsgType::Threads, MsgType::Modules]));
}

#[test]
fn test_session_scope_validation() {
    let mut f = Fixture::new();
    let id = f.session.create_breakpoint();
    assert!(f.session.set_breakpoint_scope(id, ScopeKind::System, Some(f.target), None).is_err());
    assert!(f.session.set_breakpoint_scope(id, ScopeKind::Thread, None, Some(TID)).is_err());
    assert_eq!(
        f.session.set_breakpoint_location(id, InputLocation::Address(0x1000)),
        Err(Error::InvalidLocation("address locations need a target or thread scope"))
    );
    assert_eq!(
        f.session.set_breakpoint_scope(99, ScopeKind::System, None, None),
        Err(Error::NotFound("breakpoint 99".into()))
    );
}

#[test]
fn test_enable_requires_resolvable_location() {
    let mut f = Fixture::new();
    let id = f.session.create_breakpoint();
    let result = Rc::new(RefCell::new(None));
    let out = result.clone();
    f.session
        .set_breakpoint_enabled(id, true, move |_, r| *out.borrow_mut() = Some(r));
    assert!(result.borrow().is_none());
    f.session.run_until_idle();
    assert_eq!(result.borrow_mut().take(), Some(Err(Error::NoResolvableLocation)));
    assert!(!f.session.breakpoint(id).unwrap().is_enabled());
    assert_eq!(f.mock.borrow().breakpoint_add_count, 0);
}

#[test]
fn test_partial_add_records_failed_locations() {
    let mut f = Fixture::new();
    let id = f.session.create_breakpoint();
    f.session
        .set_breakpoint_scope(id, ScopeKind::Thread, Some(f.target), Some(TID))
        .unwrap();
    f.session
        .set_breakpoint_location(id, InputLocation::Address(0x1000))
        .unwrap();
    {
        let mut mock = f.mock.borrow_mut();
        mock.breakpoint_status = Status::PARTIAL;
        mock.location_errors = vec![LocationError {
            process_koid: PID,
            thread_koid: TID,
            address: 0x1000,
            status: Status::IO,
        }];
    }
    f.session.set_breakpoint_enabled(id, true, |_, r| assert_eq!(r, Ok(())));
    f.session.run_until_idle();

    let bp = f.session.breakpoint(id).unwrap();
    assert!(bp.is_enabled());
    assert!(bp.installed_locations().is_empty());
    assert_eq!(bp.location_errors().len(), 1);
    let settings = f.mock.borrow().last_breakpoint.clone().unwrap();
    assert_eq!(settings.locations[0].thread_koid, TID);
}

#[test]
fn test_disable_and_delete_remove_from_agent() {
    let mut f = Fixture::new();
    let id = f.session.create_breakpoint();
    f.session
        .set_breakpoint_scope(id, ScopeKind::Target, Some(f.target), None)
        .unwrap();
    f.session
        .set_breakpoint_location(id, InputLocation::Address(0x1000))
        .unwrap();
    f.session.set_breakpoint_enabled(id, true, |_, r| r.unwrap());
    f.session.run_until_idle();
    assert_eq!(f.session.breakpoint(id).unwrap().installed_locations().len(), 1);

    // 有効なまま位置を変えると送り直す
    f.session
        .set_breakpoint_location(id, InputLocation::Address(0x1100))
        .unwrap();
    f.session.run_until_idle();
    assert_eq!(f.mock.borrow().breakpoint_add_count, 2);
    assert_eq!(f.mock.borrow().last_breakpoint_address, 0x1100);

    f.session.set_breakpoint_enabled(id, false, |_, r| r.unwrap());
    f.session.run_until_idle();
    assert_eq!(f.mock.borrow().breakpoint_remove_count, 1);

    // 未適用なので削除要求は出ない
    assert!(f.session.delete_breakpoint(id));
    f.session.run_until_idle();
    assert_eq!(f.mock.borrow().breakpoint_remove_count, 1);
    assert!(!f.session.delete_breakpoint(id));
}

#[test]
fn test_delete_before_add_reply_still_removes() {
    let mut f = Fixture::new();
    let id = f.session.create_breakpoint();
    f.session
        .set_breakpoint_scope(id, ScopeKind::Target, Some(f.target), None)
        .unwrap();
    f.session
        .set_breakpoint_location(id, InputLocation::Address(0x1000))
        .unwrap();
    let result = Rc::new(RefCell::new(None));
    let out = result.clone();
    f.session.set_breakpoint_enabled(id, true, move |_, r| *out.borrow_mut() = Some(r));

    // 追加の応答はまだループに積まれたまま
    assert!(f.session.delete_breakpoint(id));
    f.session.run_until_idle();
    assert_eq!(f.mock.borrow().breakpoint_add_count, 1);
    assert_eq!(f.mock.borrow().breakpoint_remove_count, 1);
    assert_eq!(result.borrow_mut().take(), Some(Err(Error::Abandoned)));
}

#[test]
fn test_one_shot_hit_deletes_locally() {
    let mut f = Fixture::new();
    let id = f.session.create_breakpoint();
    f.session
        .set_breakpoint_scope(id, ScopeKind::Target, Some(f.target), None)
        .unwrap();
    f.session
        .set_breakpoint_location(id, InputLocation::Address(0x1000))
        .unwrap();
    f.session.set_breakpoint_one_shot(id, true).unwrap();
    f.session.set_breakpoint_enabled(id, true, |_, r| r.unwrap());
    f.session.run_until_idle();
    assert!(f.mock.borrow().last_breakpoint.as_ref().unwrap().one_shot);

    f.session.handle_notification(Notification::Exception(NotifyException {
        process_koid: PID,
        thread: record(ThreadState::Suspended, &[(0x1000, 0x5000, 0)]),
        exception_type: ExceptionType::Software,
        hit_breakpoints: vec![BreakpointStats { breakpoint_id: id, hit_count: 1, should_delete: true }],
    }));
    f.session.run_until_idle();
    assert!(f.session.breakpoint(id).is_none());
    let stops = f.recorder.stops();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].stop_mode, Stop::All);
}

#[test]
fn test_continue_after_stop_uses_stop_mode() {
    for (mode, process_koid, threads) in [
        (Stop::All, 0, vec![]),
        (Stop::Process, PID, vec![]),
        (Stop::Thread, PID, vec![TID]),
    ] {
        let mut f = Fixture::new();
        let id = f.session.create_breakpoint();
        f.session
            .set_breakpoint_scope(id, ScopeKind::Target, Some(f.target), None)
            .unwrap();
        f.session
            .set_breakpoint_location(id, InputLocation::Address(0x1000))
            .unwrap();
        f.session.set_breakpoint_stop_mode(id, mode).unwrap();
        f.session.set_breakpoint_enabled(id, true, |_, r| r.unwrap());
        f.session.run_until_idle();

        f.stop(ExceptionType::Software, &[(0x1000, 0x5000, 0)], &[(id, 1)]);
        let weak = f.weak();
        f.session.continue_after_stop(&weak).unwrap();
        f.session.run_until_idle();

        let resume = f.last_resume();
        assert_eq!(resume.process_koid, process_koid);
        assert_eq!(resume.thread_koids, threads);
        assert_eq!(resume.how, ResumeHow::Continue);
    }
}

#[test]
fn test_fingerprint_cleared_on_resume() {
    let mut f = Fixture::new();
    f.stop(
        ExceptionType::SingleStep,
        &[(0x1000, 0x5000, 0x5010), (0x2000, 0x5020, 0x5030)],
        &[],
    );
    let weak = f.weak();
    let first = f.session.thread(&weak).unwrap().stack().fingerprint(0).unwrap();
    let again = f.session.thread(&weak).unwrap().stack().fingerprint(0).unwrap();
    assert_eq!(first, again);
    assert_eq!(first, FrameFingerprint::from_caller_sp(0x5020));
    assert_eq!(
        f.session.thread(&weak).unwrap().stack().fingerprint(1),
        Err(Error::FramesUnavailable(1))
    );

    f.session.continue_after_stop(&weak).unwrap();
    let stack = f.session.thread(&weak).unwrap().stack();
    assert!(stack.is_empty());
    assert_eq!(stack.fingerprint(0), Err(Error::FramesUnavailable(0)));
}

#[test]
fn test_sync_frames_fills_stack() {
    let mut f = Fixture::new();
    f.stop(ExceptionType::SingleStep, &[(0x1000, 0x5000, 0x5010)], &[]);
    f.mock.borrow_mut().frames = vec![
        StackFrame::new(0x1000, 0x5000, 0x5010),
        StackFrame::new(0x2000, 0x5020, 0x5030),
        StackFrame::new(0x2100, 0x5040, 0),
    ];
    let weak = f.weak();
    f.session.sync_frames(&weak, |_, r| r.unwrap());
    f.session.run_until_idle();

    let stack = f.session.thread(&weak).unwrap().stack();
    assert!(stack.has_all_frames());
    assert_eq!(stack.len(), 3);
    assert_eq!(stack.fingerprint(2), Ok(FrameFingerprint::OUTERMOST));
}

#[test]
fn test_stale_weak_thread_is_ignored() {
    let mut f = Fixture::new();
    let weak = f.weak();
    f.session.handle_notification(Notification::ThreadExiting(NotifyThreadExiting {
        record: record(ThreadState::Dead, &[]),
    }));
    f.session.handle_notification(Notification::ThreadStarting(NotifyThreadStarting {
        record: record(ThreadState::Suspended, &[]),
    }));
    assert!(f.session.thread(&weak).is_none());
    assert_ne!(f.weak(), weak);

    // 古い参照でのバックトレースは失敗として返る
    let result = Rc::new(RefCell::new(None));
    let out = result.clone();
    f.session
        .sync_frames(&weak, move |_, r| *out.borrow_mut() = Some(r));
    f.session.run_until_idle();
    assert_eq!(result.borrow_mut().take(), Some(Err(Error::NotFound("thread".into()))));
}

/// 最初のイベントで別の購読を解除する購読者
struct Unsubscriber {
    victim: RefCell<Option<SubscriptionId>>,
    seen: RefCell<usize>,
}

impl SessionObserver for Unsubscriber {
    fn on_event(&self, session: &mut Session, _event: &SessionEvent) {
        *self.seen.borrow_mut() += 1;
        if let Some(id) = self.victim.borrow_mut().take() {
            session.remove_observer(id);
        }
    }
}

#[test]
fn test_observers_are_notified_from_snapshot() {
    let mut f = Fixture::new();
    let unsubscriber = Rc::new(Unsubscriber { victim: RefCell::new(None), seen: RefCell::new(0) });
    f.session.add_observer(unsubscriber.clone());
    let late = Rc::new(Recorder::default());
    let late_id = f.session.add_observer(late.clone());
    *unsubscriber.victim.borrow_mut() = Some(late_id);

    f.stop(ExceptionType::General, &[(0x1000, 0x5000, 0)], &[]);
    assert_eq!(*unsubscriber.seen.borrow(), 1);
    assert_eq!(f.recorder.stops().len(), 1);
    // 解除された購読者はスナップショットにあっても呼ばれない
    assert!(late.events.borrow().is_empty());

    f.stop(ExceptionType::General, &[(0x1000, 0x5000, 0)], &[]);
    assert_eq!(*unsubscriber.seen.borrow(), 2);
    assert!(late.events.borrow().is_empty());
}

/// 名前と固定アドレスだけを持つシンボルサービス
struct FixedSymbols;

impl SymbolService for FixedSymbols {
    fn resolve_function(&self, module: &Module, name: &str) -> Vec<u64> {
        match (module.name.as_str(), name) {
            ("/bin/app", "main") => vec![module.base + 0x40],
            _ => Vec::new(),
        }
    }

    fn function_at(&self, _modules: &[Module], _address: u64) -> Option<FunctionSymbol> {
        None
    }
}

#[test]
fn test_symbol_breakpoint_follows_modules() {
    let mut f = Fixture::new();
    let mut session = std::mem::replace(
        &mut f.session,
        Session::new(Box::new(MockRemoteApi::default()), MessageLoop::new(), SessionConfig::default()),
    )
    .with_symbols(Box::new(FixedSymbols));

    let id = session.create_breakpoint();
    session
        .set_breakpoint_location(id, InputLocation::Symbol("main".into()))
        .unwrap();
    session.set_breakpoint_enabled(id, false, |_, r| r.unwrap());
    session.run_until_idle();

    // モジュールがまだないので有効にできない
    let result = Rc::new(RefCell::new(None));
    let out = result.clone();
    session.set_breakpoint_enabled(id, true, move |_, r| *out.borrow_mut() = Some(r));
    session.run_until_idle();
    assert_eq!(result.borrow_mut().take(), Some(Err(Error::NoResolvableLocation)));

    session.handle_notification(Notification::Modules(NotifyModules {
        process_koid: PID,
        modules: vec![Module { name: "/bin/app".into(), base: 0x10000 }],
        stopped_thread_koids: vec![TID],
    }));
    session.set_breakpoint_enabled(id, true, |_, r| r.unwrap());
    session.run_until_idle();
    assert_eq!(f.mock.borrow().last_breakpoint_address, 0x10040);

    // ベースが変わると解決し直す
    session.handle_notification(Notification::Modules(NotifyModules {
        process_koid: PID,
        modules: vec![Module { name: "/bin/app".into(), base: 0x20000 }],
        stopped_thread_koids: vec![],
    }));
    session.run_until_idle();
    assert_eq!(f.mock.borrow().last_breakpoint_address, 0x20040);
    assert_eq!(
        session.breakpoint(id).unwrap().installed_locations()[0].address,
        0x20040
    );
}
