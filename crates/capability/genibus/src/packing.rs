//! 报文打包
//!
//! 分两步：
//! - `plan`：只读遍历任务队列，在字节预算内贪心装入 APDU，得到 `PackedPlan`
//! - `commit`：按计划出队、生成 APDU 数据、更新任务状态，得到 `TelegramRequest`
//!
//! 成本模型（字节）：
//!
//! | 操作 | 请求 | 应答 |
//! |---|---|---|
//! | GET | ID 数 | 同请求 |
//! | SET | ID+值 | 新 APDU 时仅 APDU 头 |
//! | INFO | 1 | 请求 + 3 |
//! | ASCII | 1，独占 APDU | 请求 + 61 |
//!
//! 新开 APDU 时请求与应答各加 2 字节头。

use crate::device::DeviceState;
use crate::frame::{APDU_HEADER_BYTES, Apdu, Operation, Telegram};
use crate::task::{Task, TaskId};
use std::collections::HashMap;

/// INFO 应答每项最多比请求多出的字节数
pub const INFO_ANSWER_EXTRA: usize = 3;
/// ASCII 应答预留
pub const ASCII_ANSWER_MARGIN: usize = 61;

/// 一次打包可用的 APDU 字节预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteBudget {
    pub send: usize,
    pub answer: usize,
}

/// 计划中的 APDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedApdu {
    pub head_class: u8,
    pub operation: Operation,
    pub exclusive: bool,
    pub tasks: Vec<TaskId>,
    pub data_len: usize,
}

/// 打包计划（不修改任何状态）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedPlan {
    pub apdus: Vec<PlannedApdu>,
    /// 需要出队的任务（含无需操作而丢弃的）
    pub consumed: Vec<TaskId>,
    pub send_bytes: usize,
    pub answer_bytes: usize,
}

impl PackedPlan {
    pub fn is_empty(&self) -> bool {
        self.apdus.is_empty()
    }

    fn cost_of(&self, task: &Task, operation: Operation) -> Cost {
        let data = task.request_len(operation);
        let exclusive = task.is_ascii();
        let open = if exclusive {
            None
        } else {
            self.apdus.iter().position(|apdu| {
                !apdu.exclusive
                    && apdu.head_class == task.head_class()
                    && apdu.operation == operation
                    && apdu.data_len + data <= operation.max_apdu_data()
            })
        };
        let header = if open.is_none() { APDU_HEADER_BYTES } else { 0 };
        let send = data + header;
        let answer = match operation {
            Operation::Get if exclusive => send + ASCII_ANSWER_MARGIN,
            Operation::Get => send,
            Operation::Set => header,
            Operation::Info => send + INFO_ANSWER_EXTRA,
        };
        Cost {
            send,
            answer,
            data,
            open,
            exclusive,
        }
    }

    fn add(&mut self, id: TaskId, task: &Task, operation: Operation, cost: Cost) {
        match cost.open {
            Some(index) => {
                let apdu = &mut self.apdus[index];
                apdu.tasks.push(id);
                apdu.data_len += cost.data;
            }
            None => self.apdus.push(PlannedApdu {
                head_class: task.head_class(),
                operation,
                exclusive: cost.exclusive,
                tasks: vec![id],
                data_len: cost.data,
            }),
        }
        self.consumed.push(id);
        self.send_bytes += cost.send;
        self.answer_bytes += cost.answer;
    }
}

#[derive(Debug, Clone, Copy)]
struct Cost {
    send: usize,
    answer: usize,
    data: usize,
    open: Option<usize>,
    exclusive: bool,
}

/// 在预算内规划下一帧
///
/// 从队首依次装入；队首任务放不下时，对剩余队列做一次线性扫描，
/// 装入仍然放得下的较小任务后结束。
pub fn plan(device: &DeviceState, budget: ByteBudget) -> PackedPlan {
    let mut plan = PackedPlan::default();
    let queue: Vec<TaskId> = device.queue().collect();

    let mut stop_at = queue.len();
    for (index, &id) in queue.iter().enumerate() {
        let Some(task) = device.task(id) else {
            plan.consumed.push(id);
            continue;
        };
        let Some(operation) = task.required_operation() else {
            plan.consumed.push(id);
            continue;
        };
        let cost = plan.cost_of(task, operation);
        if !fits(&plan, budget, cost) {
            stop_at = index;
            break;
        }
        plan.add(id, task, operation, cost);
    }

    for &id in queue.iter().skip(stop_at + 1) {
        let Some(task) = device.task(id) else {
            continue;
        };
        let Some(operation) = task.required_operation() else {
            plan.consumed.push(id);
            continue;
        };
        let cost = plan.cost_of(task, operation);
        if fits(&plan, budget, cost) {
            plan.add(id, task, operation, cost);
        }
    }

    plan
}

fn fits(plan: &PackedPlan, budget: ByteBudget, cost: Cost) -> bool {
    plan.send_bytes + cost.send <= budget.send && plan.answer_bytes + cost.answer <= budget.answer
}

/// 一个 APDU 承载的任务（应答不含地址，按位置关联）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduTasks {
    /// `头类*100 + 操作码*10 + 实例号`
    pub identifier: u16,
    pub head_class: u8,
    pub operation: Operation,
    pub tasks: Vec<TaskId>,
}

/// 待发送的请求帧及其上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramRequest {
    pub telegram: Telegram,
    pub device_address: u8,
    pub task_list: Vec<ApduTasks>,
    /// 估计的应答 APDU 字节数（上界）
    pub answer_length: usize,
}

impl TelegramRequest {
    /// 空帧：标定空帧耗时或探测离线设备
    pub fn empty(device_address: u8) -> Self {
        Self {
            telegram: Telegram::empty(device_address),
            device_address,
            task_list: Vec::new(),
            answer_length: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.task_list.is_empty()
    }

    /// 请求与估计应答的 APDU 字节数之和
    pub fn estimated_body_len(&self) -> usize {
        self.telegram.body_len() + self.answer_length
    }
}

/// 执行计划：出队、生成请求数据并更新任务状态
pub fn commit(plan: PackedPlan, device: &mut DeviceState) -> TelegramRequest {
    device.task_queue.retain(|id| !plan.consumed.contains(id));

    let mut instances: HashMap<(u8, Operation), u16> = HashMap::new();
    let mut apdus = Vec::with_capacity(plan.apdus.len());
    let mut task_list = Vec::with_capacity(plan.apdus.len());

    for planned in plan.apdus {
        let instance = instances
            .entry((planned.head_class, planned.operation))
            .or_insert(0);
        let identifier = planned.head_class as u16 * 100
            + planned.operation.code() as u16 * 10
            + *instance;
        *instance += 1;

        let mut data = Vec::with_capacity(planned.data_len);
        for id in &planned.tasks {
            if let Some(task) = device.tasks.get_mut(*id) {
                data.extend(task.request_bytes(planned.operation));
                task.mark_packed(planned.operation);
            }
        }
        apdus.push(Apdu::request(planned.head_class, planned.operation, data));
        task_list.push(ApduTasks {
            identifier,
            head_class: planned.head_class,
            operation: planned.operation,
            tasks: planned.tasks,
        });
    }

    TelegramRequest {
        telegram: Telegram::request(device.address, apdus),
        device_address: device.address,
        task_list,
        answer_length: plan.answer_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, TaskSpec};
    use crate::frame::{APDU_MAX_DATA, INFO_APDU_MAX_DATA};
    use crate::task::{DataInfo, Priority};

    fn spec(name: &str, head_class: u8, address: u8, byte_size: usize) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            head_class,
            address,
            byte_size,
            priority: Priority::High,
        }
    }

    fn device(tasks: Vec<TaskSpec>) -> DeviceState {
        DeviceState::from_config(&DeviceConfig {
            address: 0x20,
            read_buffer_bytes: 70,
            send_buffer_bytes: 70,
            tasks,
        })
        .unwrap()
    }

    fn enqueue_all(device: &mut DeviceState) {
        for id in 0..device.tasks().len() {
            device.enqueue(id);
        }
    }

    fn known(device: &mut DeviceState) {
        for task in device.tasks.iter_mut() {
            task.apply_info(DataInfo::from_header(0x81));
        }
    }

    #[test]
    fn test_plan_groups_by_class_and_operation() {
        let mut device = device(vec![
            spec("a", 2, 10, 1),
            spec("b", 2, 11, 2),
            spec("c", 0, 2, 1),
        ]);
        known(&mut device);
        enqueue_all(&mut device);

        let plan = plan(&device, ByteBudget { send: 64, answer: 64 });
        assert_eq!(plan.apdus.len(), 2);
        assert_eq!(plan.apdus[0].tasks, vec![0, 1]);
        assert_eq!(plan.apdus[0].data_len, 3);
        assert_eq!(plan.send_bytes, 3 + 2 + 1 + 2);
        assert_eq!(plan.answer_bytes, plan.send_bytes);
    }

    #[test]
    fn test_plan_does_not_mutate() {
        let mut device = device(vec![spec("a", 2, 10, 1), spec("b", 2, 11, 1)]);
        enqueue_all(&mut device);
        let first = plan(&device, ByteBudget { send: 64, answer: 64 });
        let second = plan(&device, ByteBudget { send: 64, answer: 64 });
        assert_eq!(first, second);
        assert_eq!(device.queue_len(), 2);
    }

    #[test]
    fn test_info_apdu_cap() {
        let tasks = (0..20).map(|i| spec(&format!("t{}", i), 2, i as u8, 1)).collect();
        let mut device = device(tasks);
        enqueue_all(&mut device);

        let plan = plan(&device, ByteBudget { send: 200, answer: 200 });
        assert!(plan.apdus.iter().all(|a| a.operation == Operation::Info));
        assert_eq!(plan.apdus[0].data_len, INFO_APDU_MAX_DATA);
        assert_eq!(plan.apdus[1].data_len, 5);
        assert_eq!(plan.answer_bytes, plan.send_bytes + 20 * INFO_ANSWER_EXTRA);
    }

    #[test]
    fn test_get_apdu_cap() {
        let tasks = (0..40).map(|i| spec(&format!("t{}", i), 2, i as u8, 2)).collect();
        let mut device = device(tasks);
        known(&mut device);
        enqueue_all(&mut device);

        let plan = plan(&device, ByteBudget { send: 250, answer: 250 });
        assert!(plan.apdus.iter().all(|a| a.data_len <= APDU_MAX_DATA));
        assert_eq!(plan.apdus[0].data_len, 62);
    }

    #[test]
    fn test_budget_never_exceeded_and_fallback_scan() {
        let mut device = device(vec![
            spec("small", 2, 1, 1),
            spec("ascii", 7, 8, 1),
            spec("small2", 2, 2, 1),
            spec("small3", 2, 3, 1),
        ]);
        known(&mut device);
        enqueue_all(&mut device);

        let budget = ByteBudget { send: 10, answer: 10 };
        let plan = plan(&device, budget);
        assert!(plan.send_bytes <= budget.send);
        assert!(plan.answer_bytes <= budget.answer);
        // ASCII 放不下，扫描后续较小任务
        assert_eq!(plan.consumed, vec![0, 2, 3]);
    }

    #[test]
    fn test_ascii_gets_exclusive_apdu() {
        let mut device = device(vec![spec("s1", 7, 8, 1), spec("s2", 7, 9, 1)]);
        enqueue_all(&mut device);
        let plan = plan(&device, ByteBudget { send: 64, answer: 200 });
        assert_eq!(plan.apdus.len(), 2);
        assert_eq!(plan.answer_bytes, 2 * (3 + ASCII_ANSWER_MARGIN));
    }

    #[test]
    fn test_idle_tasks_are_dropped() {
        let mut device = device(vec![spec("start", 3, 6, 1), spec("stop", 3, 5, 1)]);
        enqueue_all(&mut device);
        device.tasks[1].request_command().unwrap();

        let plan = plan(&device, ByteBudget { send: 64, answer: 64 });
        assert_eq!(plan.consumed, vec![0, 1]);
        assert_eq!(plan.apdus.len(), 1);
        assert_eq!(plan.answer_bytes, APDU_HEADER_BYTES);

        let request = commit(plan, &mut device);
        assert_eq!(device.queue_len(), 0);
        assert_eq!(request.telegram.apdus[0].data, vec![5]);
        assert_eq!(request.task_list[0].identifier, 320);
        assert_eq!(device.tasks[1].required_operation(), None);
    }

    #[test]
    fn test_commit_assigns_identifiers() {
        let tasks = (0..20).map(|i| spec(&format!("t{}", i), 2, i as u8, 1)).collect();
        let mut device = device(tasks);
        enqueue_all(&mut device);

        let plan = plan(&device, ByteBudget { send: 200, answer: 200 });
        let request = commit(plan, &mut device);
        let ids: Vec<u16> = request.task_list.iter().map(|a| a.identifier).collect();
        assert_eq!(ids, vec![230, 231]);
        assert_eq!(request.telegram.destination, 0x20);
        assert!(request.telegram.to_bytes().is_ok());
    }
}
