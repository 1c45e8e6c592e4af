//! 実際のエージェントとメモリ上でつないだセッション

mod common;
#[path = "../../kokia-agent/tests/common/mod.rs"]
mod world;

use common::Recorder;
use kokia_agent::{AgentConfig, DebugAgent, Dispatcher};
use kokia_client::*;
use kokia_target::X64Arch;
use kokia_wire::*;
use std::cell::RefCell;
use std::rc::Rc;
use world::{FakePlatform, World, ARCH, PID};

const TID: u64 = 1;

struct Loopback {
    session: Session,
    api: RemoteApiImpl,
    agent: DebugAgent,
    dispatcher: Dispatcher,
    stream: Stream,
    world: Rc<RefCell<World>>,
    recorder: Rc<Recorder>,
}

impl Loopback {
    fn new() -> Self {
        let world = World::new(&[TID]);
        let agent = DebugAgent::new(
            Box::new(FakePlatform { world: world.clone() }),
            &ARCH,
            AgentConfig::default(),
        );
        let message_loop = MessageLoop::new();
        let api = RemoteApiImpl::new(message_loop.clone());
        let mut session = Session::new(Box::new(api.clone()), message_loop, SessionConfig::default())
            .with_symbols(Box::new(NoSymbols));
        let recorder = Rc::new(Recorder::default());
        session.add_observer(recorder.clone());

        Self {
            session,
            api,
            agent,
            dispatcher: Dispatcher::new(),
            stream: Stream::new(),
            world,
            recorder,
        }
    }

    /// どちらの側にも送るものがなくなるまでバイト列を行き来させる
    fn pump(&mut self) {
        loop {
            let outbound = self.api.take_write_data();
            if !outbound.is_empty() {
                self.stream.add_read_data(&outbound);
                self.dispatcher.process(&mut self.stream, &mut self.agent);
            }
            self.agent.handle_os_events(&mut self.stream);
            let inbound = self.stream.take_write_data();
            if !inbound.is_empty() {
                self.api.add_read_data(&inbound);
            }
            let ran = self.session.run_until_idle();
            if outbound.is_empty() && inbound.is_empty() && ran == 0 {
                break;
            }
        }
    }

    fn weak(&self) -> WeakThread {
        self.session.find_thread(PID, TID).expect("thread").weak()
    }

    /// 接続してアタッチし、0x1010 にブレークポイントを置く
    fn attached_with_breakpoint() -> (Self, u32) {
        Self::attached_with_breakpoint_at(0x1010)
    }

    fn attached_with_breakpoint_at(address: u64) -> (Self, u32) {
        let mut lb = Self::new();
        lb.session.connect(|_, r| assert_eq!(r, Ok(Arch::X64)));
        let target = lb.session.create_target();
        lb.session.attach(target, PID, |_, r| assert_eq!(r, Ok(PID)));
        lb.pump();

        let id = lb.session.create_breakpoint();
        lb.session
            .set_breakpoint_scope(id, ScopeKind::Target, Some(target), None)
            .unwrap();
        lb.session
            .set_breakpoint_location(id, InputLocation::Address(address))
            .unwrap();
        lb.session.set_breakpoint_enabled(id, true, |_, r| r.unwrap());
        lb.pump();
        (lb, id)
    }
}

#[test]
fn test_attach_over_the_wire() {
    let mut lb = Loopback::new();
    lb.session.connect(|_, r| assert_eq!(r, Ok(Arch::X64)));
    let target = lb.session.create_target();
    lb.session.attach(target, PID, |_, r| assert_eq!(r, Ok(PID)));
    lb.pump();

    assert!(lb.session.is_connected());
    let process = lb.session.target(target).unwrap().process().unwrap();
    assert_eq!(process.name(), "app");
    assert_eq!(process.modules()[0].name, "/bin/app");
    let thread = lb.session.find_thread(PID, TID).unwrap();
    assert_eq!(thread.state(), ThreadState::Suspended);
    assert_eq!(lb.api.pending_count(), 0);
}

#[test]
fn test_breakpoint_hit_over_the_wire() {
    let (mut lb, id) = Loopback::attached_with_breakpoint();
    assert!(lb.agent.breakpoint(id).is_some());
    assert_eq!(lb.world.borrow().byte(0x1010), 0xCC);
    assert_eq!(lb.session.breakpoint(id).unwrap().installed_locations().len(), 1);

    // 設置した命令はクライアントからは見えない
    let bytes = Rc::new(RefCell::new(Vec::new()));
    let out = bytes.clone();
    lb.session.read_memory(PID, 0x1010, 1, move |_, r| {
        *out.borrow_mut() = r.unwrap().remove(0).data;
    });
    lb.pump();
    assert_eq!(*bytes.borrow(), vec![0x90]);

    let weak = lb.weak();
    lb.session.continue_after_stop(&weak).unwrap();
    lb.pump();
    assert!(!lb.world.borrow().is_stopped(TID));

    lb.world.borrow_mut().trap(TID, 0x1010);
    lb.pump();
    let stops = lb.recorder.stops();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].exception_type, ExceptionType::Software);
    assert_eq!(stops[0].hit_breakpoints, vec![id]);
    assert_eq!(lb.session.breakpoint(id).unwrap().hit_count(), 1);
    assert_eq!(lb.session.find_thread(PID, TID).unwrap().ip(), Some(0x1010));

    // 再開するとエージェントがブレークポイントを踏み越える
    lb.recorder.clear();
    lb.session.continue_after_stop(&weak).unwrap();
    lb.pump();
    assert_eq!(lb.world.borrow().last_resume(TID), Some((true, None)));
    lb.world.borrow_mut().single_step_to(TID, 0x1011);
    lb.pump();
    assert_eq!(lb.world.borrow().last_resume(TID), Some((false, None)));
    assert!(lb.recorder.stops().is_empty());
}

#[test]
fn test_step_instruction_over_the_wire() {
    let (mut lb, _) = Loopback::attached_with_breakpoint();
    let weak = lb.weak();
    lb.session.continue_after_stop(&weak).unwrap();
    lb.pump();
    lb.world.borrow_mut().trap(TID, 0x1010);
    lb.pump();
    lb.recorder.clear();

    let result = Rc::new(RefCell::new(None));
    let out = result.clone();
    lb.session.continue_with(
        &weak,
        Box::new(StepController::new(StepMode::Instruction)),
        move |_, r| *out.borrow_mut() = Some(r),
    );
    lb.pump();
    assert_eq!(result.borrow_mut().take(), Some(Ok(())));
    assert_eq!(lb.world.borrow().last_resume(TID), Some((true, None)));

    lb.world.borrow_mut().single_step_to(TID, 0x1011);
    lb.pump();
    let stops = lb.recorder.stops();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].exception_type, ExceptionType::SingleStep);
    assert_eq!(lb.session.find_thread(PID, TID).unwrap().ip(), Some(0x1011));
}

#[test]
fn test_write_registers_and_memory_over_the_wire() {
    let (mut lb, _) = Loopback::attached_with_breakpoint();
    let weak = lb.weak();
    lb.session.continue_after_stop(&weak).unwrap();
    lb.pump();
    lb.world.borrow_mut().trap(TID, 0x1010);
    lb.pump();

    let done = Rc::new(RefCell::new(Vec::new()));
    let out = done.clone();
    lb.session.write_registers(
        &weak,
        vec![Register::from_u64(X64Arch::RIP, 0x1020)],
        move |_, r| out.borrow_mut().push(r),
    );
    let out = done.clone();
    lb.session.write_memory(PID, 0x1100, vec![1, 2, 3], move |_, r| out.borrow_mut().push(r));
    lb.pump();

    assert_eq!(*done.borrow(), vec![Ok(()), Ok(())]);
    let fake = lb.world.borrow();
    assert_eq!(fake.ip(TID), 0x1020);
    assert_eq!((fake.byte(0x1100), fake.byte(0x1102)), (1, 3));
    // 書き換えたのでフレームは取り直しになる
    assert_eq!(lb.session.find_thread(PID, TID).unwrap().ip(), None);
}

#[test]
fn test_step_over_call_through_the_agent() {
    let (mut lb, _) = Loopback::attached_with_breakpoint_at(0x1000);
    let weak = lb.weak();
    lb.session.continue_after_stop(&weak).unwrap();
    lb.pump();
    {
        let mut fake = lb.world.borrow_mut();
        fake.set_register(TID, X64Arch::RSP, 0x8800);
        fake.set_register(TID, X64Arch::RBP, 0x8810);
        fake.write_u64(0x8810, 0x8900);
        fake.write_u64(0x8818, 0x2000);
        fake.write_u64(0x8900, 0);
        fake.trap(TID, 0x1000);
    }
    lb.pump();
    assert_eq!(lb.recorder.stops().len(), 1);
    lb.recorder.clear();

    let result = Rc::new(RefCell::new(None));
    let out = result.clone();
    lb.session.continue_with(
        &weak,
        Box::new(StepOverController::new(0x1000, 0x1010)),
        move |_, r| *out.borrow_mut() = Some(r),
    );
    lb.pump();
    assert_eq!(result.borrow_mut().take(), Some(Ok(())));
    lb.world.borrow_mut().single_step_to(TID, 0x1004);
    lb.pump();

    // 0x1004 の call: 戻りアドレスを積んで呼び出し先の先頭へ
    {
        let mut fake = lb.world.borrow_mut();
        fake.set_register(TID, X64Arch::RSP, 0x87f8);
        fake.write_u64(0x87f8, 0x1008);
        fake.single_step_to(TID, 0x3000);
    }
    lb.pump();
    assert!(lb.recorder.stops().is_empty());
    assert_eq!(lb.world.borrow().byte(0x1008), 0xCC);
    assert_eq!(lb.world.borrow().last_resume(TID), Some((false, None)));

    // ret で戻り先に着く
    {
        let mut fake = lb.world.borrow_mut();
        fake.set_register(TID, X64Arch::RSP, 0x8800);
        fake.trap(TID, 0x1008);
    }
    lb.pump();
    assert!(lb.recorder.stops().is_empty());
    assert_eq!(lb.world.borrow().last_resume(TID), Some((true, None)));

    lb.world.borrow_mut().single_step_to(TID, 0x1010);
    lb.pump();
    let stops = lb.recorder.stops();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].exception_type, ExceptionType::SingleStep);
    assert_eq!(lb.session.find_thread(PID, TID).unwrap().ip(), Some(0x1010));
    assert_eq!(lb.world.borrow().byte(0x1008), 0x90);
}

#[test]
fn test_cancelled_controller_does_not_leave_breakpoint_in_agent() {
    let (mut lb, _) = Loopback::attached_with_breakpoint();
    let weak = lb.weak();
    lb.session.continue_after_stop(&weak).unwrap();
    lb.pump();
    lb.world.borrow_mut().trap(TID, 0x1010);
    lb.pump();

    // 追加の応答が届く前に取り消す
    lb.session.continue_with(&weak, Box::new(UntilController::new(0x1800)), |_, r| r.unwrap());
    assert!(lb.session.cancel_controller(&weak));
    lb.session.run_until_idle();
    lb.pump();

    assert_eq!(lb.world.borrow().byte(0x1800), 0x90);
    assert_eq!(lb.api.pending_count(), 0);
}
