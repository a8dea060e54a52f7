//! 报文调度
//!
//! 每次调用为当前轮到的设备生成一帧请求：
//!
//! 1. 轮转选择设备，疑似离线的设备只按间隔发送空帧探测
//! 2. 计算本帧预算：缓冲区上限与本周期剩余时间换算的字节数取小
//! 3. 每周期首次服务该设备时填充任务队列（HIGH / LOW 轮转 / ONCE）
//! 4. 同一周期内队列已空时，按剩余预算补充一次 LOW 任务
//! 5. `packing::plan` + `packing::commit` 生成请求

use crate::config::GenibusConfig;
use crate::device::{BUS_TURNAROUND_MS, DeviceRegistry, DeviceState};
use crate::packing::{self, ByteBudget, TelegramRequest};
use tokio::time::Instant;
use tracing::debug;

/// 预算低于该字节数时推迟到下一次
pub const MIN_SEND_BUDGET: usize = 5;
/// 周期内首帧被时间预算压缩到自然打包大小的该比例以下时，不推进设备指针
pub const STARVATION_RATIO: f64 = 0.3;

/// 本帧可用预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleBudget {
    pub budget: ByteBudget,
    /// 仅受缓冲区限制时的发送预算
    pub natural_send: usize,
    /// 发送预算是否被剩余时间压缩
    pub time_limited: bool,
}

/// 由剩余周期时间与设备缓冲区计算本帧预算
///
/// 时间换算为 `剩余毫秒 / (每字节毫秒 * 2)`：每字节耗时含往返，
/// 发送方向只占一半。`scale_answer` 打开时，应答预算按发送预算被压缩的比例同步缩小。
pub fn cycle_budget(
    device: &DeviceState,
    cycle_time_ms: f64,
    elapsed_ms: f64,
    scale_answer: bool,
) -> CycleBudget {
    let natural_send = device.send_budget();
    let natural_answer = device.answer_budget();

    let remaining_ms = cycle_time_ms - BUS_TURNAROUND_MS - elapsed_ms;
    let time_bytes = if remaining_ms > 0.0 && device.ms_per_byte > 0.0 {
        (remaining_ms / (device.ms_per_byte * 2.0)).floor() as usize
    } else {
        0
    };

    let time_limited = time_bytes < natural_send;
    let send = natural_send.min(time_bytes);
    let answer = if time_limited && scale_answer && natural_send > 0 {
        (natural_answer as f64 * time_bytes as f64 / natural_send as f64) as usize
    } else {
        natural_answer
    };

    CycleBudget {
        budget: ByteBudget { send, answer },
        natural_send,
        time_limited,
    }
}

/// 每周期首次服务设备时填充任务队列
pub fn fill_queue(device: &mut DeviceState, generation: u64, low_prio_tasks_per_cycle: usize) {
    if device.filled_generation == Some(generation) {
        return;
    }
    device.filled_generation = Some(generation);
    device.all_low_prio_tasks_added = false;
    device.low_added_in_cycle = 0;

    // 上周期 SET 过的值本周期做一次确认读；待写值保持在队列中直到 SET 发出
    for id in 0..device.tasks.len() {
        let confirm_due = device.tasks[id].advance_cycle();
        if confirm_due || device.tasks[id].pending_write().is_some() {
            device.enqueue(id);
        }
    }

    let queued_high = device
        .high_tasks
        .iter()
        .filter(|id| device.task_queue.contains(*id))
        .count();
    if queued_high < device.high_tasks.len() {
        for id in device.high_tasks.clone() {
            device.enqueue(id);
        }
    }

    add_low_tasks(device, low_prio_tasks_per_cycle, usize::MAX);

    if device.first_telegram {
        device.first_telegram = false;
        device.once_awaiting_info = device
            .once_tasks
            .iter()
            .copied()
            .filter(|id| !device.tasks[*id].information_known())
            .collect();
        for id in device.once_tasks.clone() {
            device.enqueue(id);
        }
    }

    for id in std::mem::take(&mut device.once_followup) {
        device.enqueue(id);
    }
}

/// 同一周期内队列已空时，按剩余发送预算补充 LOW 任务（每周期一次）
pub fn top_up_low_tasks(device: &mut DeviceState, generation: u64, send_budget: usize) {
    if device.topped_up_generation == Some(generation) || !device.task_queue.is_empty() {
        return;
    }
    device.topped_up_generation = Some(generation);
    let remaining_pool = device.low_tasks.len().saturating_sub(device.low_added_in_cycle);
    let added = add_low_tasks(device, remaining_pool, send_budget);
    debug!(
        target: "ems.genibus",
        device = device.address,
        added,
        "low priority tasks topped up"
    );
}

/// 从 LOW 池轮转取任务入队，返回新入队数量
fn add_low_tasks(device: &mut DeviceState, count: usize, send_budget: usize) -> usize {
    let pool = device.low_tasks.len();
    let mut added = 0;
    let mut used = 0;
    for _ in 0..pool {
        if added >= count {
            break;
        }
        let id = device.low_tasks[device.low_cursor % pool];
        let cost = device
            .task(id)
            .and_then(|task| task.required_operation().map(|op| task.request_len(op)))
            .unwrap_or(0);
        if used + cost > send_budget {
            break;
        }
        device.low_cursor = (device.low_cursor + 1) % pool;
        if device.enqueue(id) {
            added += 1;
            used += cost;
        }
    }
    device.low_added_in_cycle += added;
    if device.low_added_in_cycle >= pool {
        device.all_low_prio_tasks_added = true;
    }
    added
}

/// 报文生成器
#[derive(Debug, Clone)]
pub struct TelegramBuilder {
    low_prio_tasks_per_cycle: usize,
    scale_answer_budget: bool,
}

impl TelegramBuilder {
    pub fn new(config: &GenibusConfig) -> Self {
        Self {
            low_prio_tasks_per_cycle: config.low_prio_tasks_per_cycle,
            scale_answer_budget: config.scale_answer_budget,
        }
    }

    /// 为下一个有事可做的设备生成请求；本周期无事可做时返回 `None`
    pub fn next_telegram(
        &self,
        registry: &mut DeviceRegistry,
        cycle_time_ms: f64,
        elapsed_ms: f64,
        now: Instant,
    ) -> Option<TelegramRequest> {
        let count = registry.len();
        let generation = registry.generation();
        let start = registry.cursor();

        for step in 0..count {
            let index = (start + step) % count;
            let device = &mut registry.devices_mut()[index];
            if let Some((request, advance)) =
                self.build_for_device(device, generation, cycle_time_ms, elapsed_ms, now)
            {
                registry.set_cursor(if advance { index + 1 } else { index });
                return Some(request);
            }
        }
        None
    }

    /// 返回请求与是否推进设备指针
    fn build_for_device(
        &self,
        device: &mut DeviceState,
        generation: u64,
        cycle_time_ms: f64,
        elapsed_ms: f64,
        now: Instant,
    ) -> Option<(TelegramRequest, bool)> {
        let budget = cycle_budget(device, cycle_time_ms, elapsed_ms, self.scale_answer_budget);
        if budget.budget.send < MIN_SEND_BUDGET {
            return None;
        }

        if device.is_suspected_offline() {
            if !device.probe_due(now) {
                return None;
            }
            device.last_probe = Some(now);
            debug!(target: "ems.genibus", device = device.address, "probing offline device");
            return Some((TelegramRequest::empty(device.address), true));
        }

        if !device.empty_telegram_sent {
            device.empty_telegram_sent = true;
            return Some((TelegramRequest::empty(device.address), true));
        }

        fill_queue(device, generation, self.low_prio_tasks_per_cycle);
        if device.task_queue.is_empty() {
            top_up_low_tasks(device, generation, budget.budget.send);
        }

        let plan = packing::plan(device, budget.budget);
        if plan.is_empty() {
            device.task_queue.retain(|id| !plan.consumed.contains(id));
            return None;
        }

        let first_this_cycle = device.served_generation != Some(generation);
        device.served_generation = Some(generation);
        // 同一队列仅受缓冲区限制时能打包的字节数
        let natural_bytes = if first_this_cycle && budget.time_limited {
            let natural = ByteBudget {
                send: budget.natural_send,
                answer: device.answer_budget(),
            };
            packing::plan(device, natural).send_bytes
        } else {
            plan.send_bytes
        };
        let send_bytes = plan.send_bytes;
        let request = packing::commit(plan, device);

        let starved = (send_bytes as f64) < natural_bytes as f64 * STARVATION_RATIO;
        if starved {
            debug!(
                target: "ems.genibus",
                device = device.address,
                send_bytes,
                natural_bytes,
                "telegram shrunk by cycle time, device keeps its turn"
            );
        }
        Some((request, !starved))
    }
}
