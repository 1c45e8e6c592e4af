//! スタックフレームとフレームフィンガープリント

use crate::error::{Error, Result};
use kokia_wire::StackFrame;
use std::cell::OnceCell;

/// 1つのスタックフレーム
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub ip: u64,
    pub sp: u64,
    /// 0 は不明
    pub bp: u64,
}

impl Frame {
    pub fn new(ip: u64, sp: u64, bp: u64) -> Self {
        Self { ip, sp, bp }
    }
}

impl From<&StackFrame> for Frame {
    fn from(frame: &StackFrame) -> Self {
        Self::new(frame.ip, frame.sp, frame.bp)
    }
}

/// フレームの呼び出しを識別する値
///
/// 呼び出し元フレームのスタックアドレスから作るので、1命令ごとには変わらず、
/// 再帰呼び出しの別々の実行は区別できます。スタックは下に伸びるので、
/// 値が小さいほど新しい（深い）フレームです。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameFingerprint(u64);

impl FrameFingerprint {
    /// 呼び出し元がない最外フレーム
    pub const OUTERMOST: FrameFingerprint = FrameFingerprint(u64::MAX);

    /// 呼び出し元フレームのスタックポインタから作る
    pub fn from_caller_sp(caller_sp: u64) -> Self {
        Self(caller_sp)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// `other` より深いフレームか
    pub fn is_newer_than(self, other: FrameFingerprint) -> bool {
        self.0 < other.0
    }
}

/// 計算できるフィンガープリントを先頭から並べる
///
/// フレーム0はいつでも計算できます。それより深いフレームは全フレームが揃っている
/// 場合だけで、最後のフレームは最外フレームとして扱います。
pub fn compute_fingerprints(frames: &[Frame], has_all_frames: bool) -> Vec<FrameFingerprint> {
    let computable = if has_all_frames { frames.len() } else { frames.len().min(1) };
    (0..computable)
        .map(|i| match frames.get(i + 1) {
            Some(caller) => FrameFingerprint::from_caller_sp(caller.sp),
            None => FrameFingerprint::OUTERMOST,
        })
        .collect()
}

/// スレッドのバックトレース
///
/// 停止通知に含まれていた0〜2フレームから始まり、`Session::sync_frames` で
/// 全フレームに置き換わります。フィンガープリントは初回の参照で計算して
/// キャッシュし、フレームが変わると破棄します。
#[derive(Debug, Default)]
pub struct Stack {
    frames: Vec<Frame>,
    has_all_frames: bool,
    fingerprints: OnceCell<Vec<FrameFingerprint>>,
}

impl Stack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn has_all_frames(&self) -> bool {
        self.has_all_frames
    }

    pub fn set_frames(&mut self, frames: Vec<Frame>, has_all_frames: bool) {
        self.frames = frames;
        self.has_all_frames = has_all_frames;
        self.fingerprints = OnceCell::new();
    }

    /// スレッドが動き出したらフレームは意味を失う
    pub fn clear_frames(&mut self) {
        self.set_frames(Vec::new(), false);
    }

    pub fn fingerprint(&self, index: usize) -> Result<FrameFingerprint> {
        self.fingerprints
            .get_or_init(|| compute_fingerprints(&self.frames, self.has_all_frames))
            .get(index)
            .copied()
            .ok_or(Error::FramesUnavailable(index))
    }
}
