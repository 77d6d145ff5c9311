//! 结算事件队列与延迟重投递调度器
//!
//! 队列是进程内的有界通道：满了就丢弃事件并记日志，被丢弃的订单
//! 停留在非终态，之后由对账扫描重新入队。因此发布永远不会阻塞
//! 请求路径，也不会因为下游慢而无限堆积内存。
//!
//! 重投递不靠为每个事件单独起一个睡眠任务，而是由单个调度器任务
//! 维护一个按到期时间排序的小顶堆，统一等待最近的到期点。

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::models::OrderEvent;

/// 创建结算事件队列
pub fn channel(capacity: usize) -> (EventPublisher, EventSubscriber) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventPublisher { tx }, EventSubscriber { rx })
}

/// 结算事件发布端
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<OrderEvent>,
}

impl EventPublisher {
    /// 非阻塞发布
    ///
    /// 队列满时丢弃事件：订单仍是非终态，对账扫描会把它重新捞起来。
    pub fn publish(&self, event: OrderEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    order_number = %event.order_number,
                    attempt = event.attempt,
                    "结算队列已满，丢弃事件，等待对账扫描重新入队"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                error!(
                    order_number = %event.order_number,
                    "结算队列已关闭，事件无法投递"
                );
            }
        }
    }
}

/// 结算事件订阅端
pub struct EventSubscriber {
    rx: mpsc::Receiver<OrderEvent>,
}

impl EventSubscriber {
    /// 接收下一条事件，队列关闭且清空后返回 None
    pub async fn recv(&mut self) -> Option<OrderEvent> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// RepublishScheduler — 延迟重投递
// ---------------------------------------------------------------------------

struct Scheduled {
    due: Instant,
    event: OrderEvent,
}

/// 重投递调度句柄
///
/// 工作者通过它登记"在 delay 之后把事件重新放回队列"。
#[derive(Clone)]
pub struct RepublishScheduler {
    tx: mpsc::UnboundedSender<Scheduled>,
}

impl RepublishScheduler {
    pub fn schedule(&self, event: OrderEvent, delay: Duration) {
        debug!(
            order_number = %event.order_number,
            attempt = event.attempt,
            delay_ms = delay.as_millis() as u64,
            "登记延迟重投递"
        );
        let scheduled = Scheduled {
            due: Instant::now() + delay,
            event,
        };
        if self.tx.send(scheduled).is_err() {
            error!("重投递调度器已停止，事件丢弃");
        }
    }
}

/// 堆元素：按到期时间排序，seq 保证同刻到期的事件先进先出
struct Pending {
    due: Instant,
    seq: u64,
    event: OrderEvent,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// 重投递调度器驱动任务
///
/// 单任务维护到期堆：收到关停信号时退出，堆里未到期的事件随之丢弃，
/// 对应订单由下次启动后的对账扫描接管。
pub struct SchedulerDriver {
    rx: mpsc::UnboundedReceiver<Scheduled>,
    publisher: EventPublisher,
    pending: BinaryHeap<Reverse<Pending>>,
    next_seq: u64,
}

impl SchedulerDriver {
    pub fn new(publisher: EventPublisher) -> (RepublishScheduler, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            RepublishScheduler { tx },
            Self {
                rx,
                publisher,
                pending: BinaryHeap::new(),
                next_seq: 0,
            },
        )
    }

    fn push(&mut self, scheduled: Scheduled) {
        self.pending.push(Reverse(Pending {
            due: scheduled.due,
            seq: self.next_seq,
            event: scheduled.event,
        }));
        self.next_seq += 1;
    }

    /// 把所有已到期的事件重新发布
    fn flush_due(&mut self, now: Instant) {
        while let Some(Reverse(head)) = self.pending.peek() {
            if head.due > now {
                break;
            }
            if let Some(Reverse(pending)) = self.pending.pop() {
                debug!(
                    order_number = %pending.event.order_number,
                    attempt = pending.event.attempt,
                    "重投递事件到期，重新入队"
                );
                self.publisher.publish(pending.event);
            }
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("重投递调度器启动");

        loop {
            let next_due = self.pending.peek().map(|Reverse(p)| p.due);

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(pending = self.pending.len(), "重投递调度器收到关停信号");
                        break;
                    }
                }
                request = self.rx.recv() => {
                    match request {
                        Some(scheduled) => self.push(scheduled),
                        None => {
                            info!("所有调度句柄已释放，重投递调度器退出");
                            break;
                        }
                    }
                }
                _ = async {
                    // next_due 为 None 时该分支被 if 守卫禁用，不会执行
                    tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)).await
                }, if next_due.is_some() => {
                    self.flush_due(Instant::now());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn event(number: &str, attempt: u32) -> OrderEvent {
        OrderEvent {
            order_id: Uuid::new_v4(),
            order_number: number.to_string(),
            user_id: Uuid::new_v4(),
            attempt,
        }
    }

    #[tokio::test]
    async fn test_publish_and_recv() {
        let (publisher, mut subscriber) = channel(4);

        publisher.publish(event("1", 0));
        publisher.publish(event("2", 0));

        assert_eq!(subscriber.recv().await.unwrap().order_number, "1");
        assert_eq!(subscriber.recv().await.unwrap().order_number, "2");
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (publisher, mut subscriber) = channel(1);

        publisher.publish(event("1", 0));
        // 队列已满，第二条被丢弃而不是阻塞
        publisher.publish(event("2", 0));

        assert_eq!(subscriber.recv().await.unwrap().order_number, "1");
        drop(publisher);
        assert!(subscriber.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_republishes_after_delay() {
        let (publisher, mut subscriber) = channel(8);
        let (scheduler, driver) = SchedulerDriver::new(publisher);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(driver.run(shutdown_rx));

        scheduler.schedule(event("1", 1), Duration::from_millis(50));

        // 时间虚拟推进到到期点之后
        tokio::time::sleep(Duration::from_millis(60)).await;

        let republished = subscriber.recv().await.unwrap();
        assert_eq!(republished.order_number, "1");
        assert_eq!(republished.attempt, 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_orders_by_due_time() {
        let (publisher, mut subscriber) = channel(8);
        let (scheduler, driver) = SchedulerDriver::new(publisher);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(driver.run(shutdown_rx));

        // 先登记晚到期的，再登记早到期的
        scheduler.schedule(event("late", 1), Duration::from_millis(100));
        scheduler.schedule(event("early", 1), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(subscriber.recv().await.unwrap().order_number, "early");
        assert_eq!(subscriber.recv().await.unwrap().order_number, "late");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_shutdown() {
        let (publisher, _subscriber) = channel(8);
        let (_scheduler, driver) = SchedulerDriver::new(publisher);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(driver.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
