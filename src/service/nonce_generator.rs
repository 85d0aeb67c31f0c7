//! Nonce 生成器（雪花算法）
//!
//! 64 位布局：1 位保留 | 41 位毫秒时间戳（自 EPOCH 起）| 10 位节点ID | 12 位序列号。
//! 同一节点身份下 nonce 严格递增，重启后时间戳前进保证不与重启前重复。
//! 单毫秒内序列号用尽时借用下一毫秒，不阻塞调用方。

use std::sync::Mutex;

use crate::{
    config::MAX_NODE_ID,
    error::{OwtpError, Result},
    utils::time_utils::current_timestamp_ms,
};

/// 起始纪元（毫秒）：2010-11-04T01:42:54.657Z
pub const EPOCH_MS: i64 = 1_288_834_974_657;

const NODE_BITS: u32 = 10;
const STEP_BITS: u32 = 12;
const STEP_MASK: u64 = (1 << STEP_BITS) - 1;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;
const TIME_SHIFT: u32 = NODE_BITS + STEP_BITS;

#[derive(Debug)]
struct GeneratorState {
    last_ms: i64,
    step: u64,
    /// 最近一次读到的时钟，序列号借用的毫秒不计入
    last_wall_ms: i64,
}

/// Nonce 生成器，可被多个任务并发调用
#[derive(Debug)]
pub struct NonceGenerator {
    node_id: u16,
    state: Mutex<GeneratorState>,
}

impl NonceGenerator {
    pub fn new(node_id: u16) -> Result<Self> {
        if node_id > MAX_NODE_ID {
            return Err(OwtpError::Config(format!(
                "node id {} out of range (0..={})",
                node_id, MAX_NODE_ID
            )));
        }

        Ok(Self {
            node_id,
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                step: 0,
                last_wall_ms: 0,
            }),
        })
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// 生成下一个 nonce
    pub fn generate(&self) -> u64 {
        let (nonce, regressed) = self.next_at((current_timestamp_ms() - EPOCH_MS).max(0));
        if let Some((last_ms, now_ms)) = regressed {
            tracing::warn!(last_ms, now_ms, "Clock moved backwards, reusing last nonce timestamp");
        }
        nonce
    }

    /// 以给定时钟读数（自 EPOCH 起的毫秒）生成 nonce；时钟回拨时额外返回 (上次读数, 本次读数)
    fn next_at(&self, wall_ms: i64) -> (u64, Option<(i64, i64)>) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let regressed = (wall_ms < state.last_wall_ms).then_some((state.last_wall_ms, wall_ms));
        state.last_wall_ms = state.last_wall_ms.max(wall_ms);

        // 时钟回拨或仍落后于借用的毫秒时沿用上次时间戳，保证单调
        let mut now = wall_ms.max(state.last_ms);

        if now == state.last_ms {
            state.step = (state.step + 1) & STEP_MASK;
            if state.step == 0 {
                // 当前毫秒序列号用尽，借用下一毫秒；时钟追上后自然对齐
                now = state.last_ms + 1;
            }
        } else {
            state.step = 0;
        }

        state.last_ms = now;

        let nonce = ((now as u64) << TIME_SHIFT) | ((self.node_id as u64) << STEP_BITS) | state.step;
        (nonce, regressed)
    }

    /// 拆解 nonce：(unix 毫秒时间戳, 节点ID, 序列号)
    pub fn decompose(nonce: u64) -> (i64, u16, u16) {
        let timestamp_ms = (nonce >> TIME_SHIFT) as i64 + EPOCH_MS;
        let node_id = ((nonce >> STEP_BITS) & NODE_MASK) as u16;
        let step = (nonce & STEP_MASK) as u16;
        (timestamp_ms, node_id, step)
    }
}
