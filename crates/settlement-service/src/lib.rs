//! 积分结算服务
//!
//! 订单上传后进入异步结算管道：结算工作者查询外部积分计算服务，
//! 把终态结果原子地写回订单与账本；用户余额永远由账本流水推导。
//! 提现在存储层的串行化守卫下执行，并发提现不可能透支。

pub mod api;
pub mod error;
pub mod gateway;
pub mod models;
pub mod queue;
pub mod reconciler;
pub mod service;
pub mod store;
pub mod worker;
