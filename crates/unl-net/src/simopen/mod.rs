//! Simultaneous-Open Engine: clock-synchronized meeting time plus the
//! connect-attempt race that turns a predicted port pair into a live
//! `TcpStream`.

mod engine;

pub use engine::{attend_fight, plan_meeting, wait_for_meeting};
