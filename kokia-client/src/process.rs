//! デバッグ中のプロセス

use crate::thread::Thread;
use kokia_wire::Module;
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct Process {
    koid: u64,
    name: String,
    pub(crate) threads: BTreeMap<u64, Thread>,
    pub(crate) modules: Vec<Module>,
}

impl Process {
    pub(crate) fn new(koid: u64, name: String) -> Self {
        Self {
            koid,
            name,
            threads: BTreeMap::new(),
            modules: Vec::new(),
        }
    }

    pub fn koid(&self) -> u64 {
        self.koid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread(&self, koid: u64) -> Option<&Thread> {
        self.threads.get(&koid)
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }
}
