//! フレームポインタによるスタックの巻き戻し
//!
//! フレームレコードは `[bp] = 呼び出し元のbp`, `[bp + 8] = 戻りアドレス` で、
//! 呼び出し元のspは `bp + 16` になる（x86-64 と ARM64 で共通）。

use kokia_wire::StackFrame;

/// `ip, sp, bp` から始めて最大 `max_frames` 個のフレームを返す
pub fn unwind(
    ip: u64,
    sp: u64,
    bp: u64,
    max_frames: usize,
    mut read_u64: impl FnMut(u64) -> Option<u64>,
) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    if max_frames == 0 {
        return frames;
    }
    frames.push(StackFrame::new(ip, sp, bp));

    let mut bp = bp;
    while frames.len() < max_frames && bp != 0 {
        // bp はデバッグ対象が自由に書き換えられるので桁あふれを許さない
        let (Some(ra_slot), Some(caller_sp)) = (bp.checked_add(8), bp.checked_add(16)) else {
            break;
        };
        let (Some(caller_bp), Some(return_address)) = (read_u64(bp), read_u64(ra_slot)) else {
            break;
        };
        if return_address == 0 {
            break;
        }
        frames.push(StackFrame::new(return_address, caller_sp, caller_bp));

        // スタックは下に伸びるので、呼び出し元のフレームは必ず上にある
        if caller_bp <= bp {
            break;
        }
        bp = caller_bp;
    }

    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn stack(words: &[(u64, u64)]) -> HashMap<u64, u64> {
        words.iter().copied().collect()
    }

    #[test]
    fn test_unwind_chain() {
        // main(bp=0x5100) <- foo(bp=0x5020) <- bar(bp=0x5000)
        let mem = stack(&[
            (0x5000, 0x5020),
            (0x5008, 0x2004),
            (0x5020, 0x5100),
            (0x5028, 0x1008),
            (0x5100, 0),
            (0x5108, 0),
        ]);
        let frames = unwind(0x3000, 0x4ff0, 0x5000, 256, |a| mem.get(&a).copied());
        assert_eq!(
            frames,
            vec![
                StackFrame::new(0x3000, 0x4ff0, 0x5000),
                StackFrame::new(0x2004, 0x5010, 0x5020),
                StackFrame::new(0x1008, 0x5030, 0x5100),
            ]
        );
    }

    #[test]
    fn test_unwind_respects_limit() {
        let mem = stack(&[(0x5000, 0x5020), (0x5008, 0x2004), (0x5020, 0x5100), (0x5028, 0x1008)]);
        let frames = unwind(0x3000, 0x4ff0, 0x5000, 2, |a| mem.get(&a).copied());
        assert_eq!(frames.len(), 2);
        assert!(unwind(0x3000, 0x4ff0, 0x5000, 0, |a| mem.get(&a).copied()).is_empty());
    }

    #[test]
    fn test_unwind_stops_on_unreadable_or_looping_frame() {
        let frames = unwind(0x3000, 0x4ff0, 0x5000, 256, |_| None);
        assert_eq!(frames.len(), 1);

        let mem = stack(&[(0x5000, 0x5000), (0x5008, 0x2004)]);
        let frames = unwind(0x3000, 0x4ff0, 0x5000, 256, |a| mem.get(&a).copied());
        assert_eq!(frames.len(), 2);

        let frames = unwind(0x3000, 0x4ff0, 0, 256, |a| mem.get(&a).copied());
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_unwind_base_pointer_near_top_of_address_space() {
        let frames = unwind(0x1000, 0x10, u64::MAX - 3, 4, |_| Some(0x2000));
        assert_eq!(frames, vec![StackFrame::new(0x1000, 0x10, u64::MAX - 3)]);

        // 戻りアドレスは読めても呼び出し元の sp が表せない
        let frames = unwind(0x1000, 0x10, u64::MAX - 15, 4, |_| Some(0x2000));
        assert_eq!(frames.len(), 1);
    }
}
