//! テスト用の偽OS
//!
//! メモリ・レジスタ・スレッドの実行状態を `World` に持ち、
//! エージェントが発行した操作を記録します。

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use kokia_agent::{AgentConfig, DebugAgent, Dispatcher};
use kokia_target::{ExceptionKind, OsEvent, Platform, ProcessHandle, ThreadHandle, X64Arch};
use kokia_wire::*;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

pub static ARCH: X64Arch = X64Arch;

pub const PID: u64 = 100;
pub const CODE_BASE: u64 = 0x1000;
pub const CODE_SIZE: u64 = 0x4000;
pub const STACK_BASE: u64 = 0x8000;
pub const STACK_SIZE: u64 = 0x1000;

#[derive(Debug, Default)]
pub struct FakeThread {
    pub registers: BTreeMap<u32, u64>,
    /// OS上で止まっているか
    pub stopped: bool,
    pub suspend_count: u32,
    /// (single_step, signal)
    pub resumes: Vec<(bool, Option<i32>)>,
}

#[derive(Debug, Default)]
pub struct World {
    pub memory: BTreeMap<u64, u8>,
    pub regions: Vec<(u64, u64)>,
    pub threads: BTreeMap<u64, FakeThread>,
    pub events: VecDeque<OsEvent>,
    pub modules: Vec<Module>,
    pub killed: bool,
    pub detached: bool,
}

impl World {
    pub fn new(tids: &[u64]) -> Rc<RefCell<World>> {
        let mut world = World {
            regions: vec![(CODE_BASE, CODE_SIZE), (STACK_BASE, STACK_SIZE)],
            modules: vec![Module { name: "/bin/app".into(), base: CODE_BASE }],
            ..Default::default()
        };
        for &tid in tids {
            let mut thread = FakeThread { stopped: true, ..Default::default() };
            thread.registers.insert(X64Arch::RIP, CODE_BASE);
            thread.registers.insert(X64Arch::RSP, STACK_BASE + 0x800);
            thread.registers.insert(X64Arch::RBP, 0);
            world.threads.insert(tid, thread);
        }
        Rc::new(RefCell::new(world))
    }

    fn mapped(&self, address: u64, size: usize) -> bool {
        let Some(end) = address.checked_add(size as u64) else {
            return false;
        };
        self.regions
            .iter()
            .any(|(base, len)| *base <= address && end <= base + len)
    }

    /// 未設定のバイトは nop
    pub fn byte(&self, address: u64) -> u8 {
        self.memory.get(&address).copied().unwrap_or(0x90)
    }

    pub fn write_u64(&mut self, address: u64, value: u64) {
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            self.memory.insert(address + i as u64, *b);
        }
    }

    pub fn ip(&self, tid: u64) -> u64 {
        self.threads[&tid].registers[&X64Arch::RIP]
    }

    pub fn set_register(&mut self, tid: u64, id: u32, value: u64) {
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.registers.insert(id, value);
        }
    }

    pub fn last_resume(&self, tid: u64) -> Option<(bool, Option<i32>)> {
        self.threads[&tid].resumes.last().copied()
    }

    pub fn resume_count(&self, tid: u64) -> usize {
        self.threads[&tid].resumes.len()
    }

    pub fn is_stopped(&self, tid: u64) -> bool {
        self.threads[&tid].stopped
    }

    /// 走行中のスレッドがブレークポイント命令を実行したことにする
    pub fn trap(&mut self, tid: u64, address: u64) {
        self.set_stopped(tid, address + 1);
        self.events.push_back(OsEvent::Exception {
            pid: PID,
            tid,
            kind: ExceptionKind::SoftwareBreakpoint,
        });
    }

    /// シングルステップが完了して `ip` に着いたことにする
    pub fn single_step_to(&mut self, tid: u64, ip: u64) {
        self.set_stopped(tid, ip);
        self.events.push_back(OsEvent::Exception { pid: PID, tid, kind: ExceptionKind::SingleStep });
    }

    fn set_stopped(&mut self, tid: u64, ip: u64) {
        let thread = self.threads.entry(tid).or_default();
        thread.stopped = true;
        thread.registers.insert(X64Arch::RIP, ip);
    }
}

pub struct FakePlatform {
    pub world: Rc<RefCell<World>>,
}

impl Platform for FakePlatform {
    fn launch(&mut self, argv: &[String]) -> Result<Box<dyn ProcessHandle>> {
        if argv[0] == "/missing" {
            bail!("No such file");
        }
        Ok(Box::new(FakeProcess { world: self.world.clone() }))
    }

    fn attach(&mut self, pid: u64) -> Result<Box<dyn ProcessHandle>> {
        if pid != PID {
            bail!("No such process {}", pid);
        }
        Ok(Box::new(FakeProcess { world: self.world.clone() }))
    }

    fn process_tree(&self) -> Result<ProcessTreeRecord> {
        Ok(ProcessTreeRecord {
            kind: ProcessTreeKind::Job,
            koid: 0,
            name: "system".into(),
            children: vec![ProcessTreeRecord {
                kind: ProcessTreeKind::Process,
                koid: PID,
                name: "app".into(),
                children: Vec::new(),
            }],
        })
    }

    fn poll_events(&mut self) -> Vec<OsEvent> {
        self.world.borrow_mut().events.drain(..).collect()
    }
}

pub struct FakeProcess {
    pub world: Rc<RefCell<World>>,
}

impl ProcessHandle for FakeProcess {
    fn koid(&self) -> u64 {
        PID
    }

    fn name(&self) -> String {
        "app".into()
    }

    fn thread_koids(&self) -> Result<Vec<u64>> {
        Ok(self.world.borrow().threads.keys().copied().collect())
    }

    fn thread(&self, koid: u64) -> Box<dyn ThreadHandle> {
        Box::new(FakeThreadHandle { world: self.world.clone(), tid: koid })
    }

    fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let world = self.world.borrow();
        if !world.mapped(address, size) {
            bail!("Unmapped address 0x{:x}", address);
        }
        Ok((0..size as u64).map(|i| world.byte(address + i)).collect())
    }

    fn write_memory(&self, address: u64, data: &[u8]) -> Result<()> {
        let mut world = self.world.borrow_mut();
        if !world.mapped(address, data.len()) {
            bail!("Unmapped address 0x{:x}", address);
        }
        for (i, b) in data.iter().enumerate() {
            world.memory.insert(address + i as u64, *b);
        }
        Ok(())
    }

    fn address_space(&self) -> Result<Vec<AddressRegion>> {
        Ok(self
            .world
            .borrow()
            .regions
            .iter()
            .map(|(base, size)| AddressRegion {
                name: format!("0x{:x}", base),
                base: *base,
                size: *size,
                depth: 0,
            })
            .collect())
    }

    fn modules(&self) -> Result<Vec<Module>> {
        Ok(self.world.borrow().modules.clone())
    }

    fn kill(&self) -> Result<()> {
        self.world.borrow_mut().killed = true;
        Ok(())
    }

    fn detach(&self) -> Result<()> {
        let mut world = self.world.borrow_mut();
        world.detached = true;
        for thread in world.threads.values_mut() {
            thread.stopped = false;
        }
        Ok(())
    }
}

pub struct FakeThreadHandle {
    world: Rc<RefCell<World>>,
    tid: u64,
}

impl ThreadHandle for FakeThreadHandle {
    fn koid(&self) -> u64 {
        self.tid
    }

    fn name(&self) -> String {
        format!("thread-{}", self.tid)
    }

    fn suspend(&self) -> Result<()> {
        let mut world = self.world.borrow_mut();
        let thread = world.threads.get_mut(&self.tid).ok_or_else(|| anyhow!("No thread"))?;
        thread.suspend_count += 1;
        thread.stopped = true;
        Ok(())
    }

    fn resume(&self, single_step: bool, signal: Option<i32>) -> Result<()> {
        let mut world = self.world.borrow_mut();
        let thread = world.threads.get_mut(&self.tid).ok_or_else(|| anyhow!("No thread"))?;
        thread.stopped = false;
        thread.resumes.push((single_step, signal));
        Ok(())
    }

    fn read_registers(&self) -> Result<Vec<Register>> {
        let world = self.world.borrow();
        let thread = world.threads.get(&self.tid).ok_or_else(|| anyhow!("No thread"))?;
        Ok(thread
            .registers
            .iter()
            .map(|(id, value)| Register::from_u64(*id, *value))
            .collect())
    }

    fn write_registers(&self, registers: &[Register]) -> Result<()> {
        let mut world = self.world.borrow_mut();
        let thread = world.threads.get_mut(&self.tid).ok_or_else(|| anyhow!("No thread"))?;
        for register in registers {
            thread.registers.insert(register.id, register.value());
        }
        Ok(())
    }
}

/// ハンドシェイク済みのエージェントとディスパッチャ
pub struct Harness {
    pub world: Rc<RefCell<World>>,
    pub agent: DebugAgent,
    pub dispatcher: Dispatcher,
    pub stream: Stream,
    next_transaction: u32,
}

impl Harness {
    pub fn new(tids: &[u64]) -> Self {
        let world = World::new(tids);
        let agent = DebugAgent::new(
            Box::new(FakePlatform { world: world.clone() }),
            &ARCH,
            AgentConfig::default(),
        );
        let mut harness = Self {
            world,
            agent,
            dispatcher: Dispatcher::new(),
            stream: Stream::new(),
            next_transaction: 1,
        };
        let reply = harness.call(&HelloRequest { version: PROTOCOL_VERSION });
        assert!(reply.status.is_ok());
        harness
    }

    /// アタッチして、続くスレッド通知を捨てる
    pub fn attached(tids: &[u64]) -> Self {
        let mut harness = Self::new(tids);
        let reply = harness.call(&AttachRequest { koid: PID });
        assert_eq!(reply.status, Status::OK);
        harness.drain_notifications();
        harness
    }

    /// 要求を送り、応答を読む（応答より前の通知は残す）
    pub fn call<R: Request>(&mut self, request: &R) -> R::Reply {
        let tid = self.next_transaction;
        self.next_transaction += 1;
        self.stream.add_read_data(&encode_message(request, tid));
        self.dispatcher.process(&mut self.stream, &mut self.agent);

        let out = self.stream.take_write_data();
        let mut pos = 0;
        let mut found = None;
        let mut rest = Vec::new();
        while pos < out.len() {
            let header = decode_header(&out[pos..]).expect("valid header");
            let end = pos + header.size as usize;
            if header.transaction_id == tid && found.is_none() {
                found = Some(decode_message::<R::Reply>(&out[pos..end]).expect("reply").1);
            } else {
                rest.extend_from_slice(&out[pos..end]);
            }
            pos = end;
        }
        self.stream.write(&rest);
        found.expect("no reply written")
    }

    /// OSイベントを処理して通知を取り出す
    pub fn pump(&mut self) -> Vec<Notification> {
        self.agent.handle_os_events(&mut self.stream);
        self.drain_notifications()
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let out = self.stream.take_write_data();
        let mut pos = 0;
        let mut notifications = Vec::new();
        while pos < out.len() {
            let header = decode_header(&out[pos..]).expect("valid header");
            let end = pos + header.size as usize;
            notifications.push(Notification::decode(&header, &out[pos..end]).expect("notification"));
            pos = end;
        }
        notifications
    }

    pub fn add_breakpoint(&mut self, id: u32, stop: Stop, locations: &[(u64, u64)]) -> AddOrChangeBreakpointReply {
        self.call(&AddOrChangeBreakpointRequest {
            breakpoint: BreakpointSettings {
                breakpoint_id: id,
                stop,
                one_shot: false,
                locations: locations
                    .iter()
                    .map(|(thread_koid, address)| ProcessBreakpointSettings {
                        process_koid: PID,
                        thread_koid: *thread_koid,
                        address: *address,
                    })
                    .collect(),
            },
        })
    }

    pub fn resume(&mut self, threads: &[u64], how: ResumeHow) -> ResumeReply {
        self.call(&ResumeRequest {
            process_koid: PID,
            thread_koids: threads.to_vec(),
            how,
            range_begin: 0,
            range_end: 0,
        })
    }
}
