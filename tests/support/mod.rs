#![allow(dead_code)]

pub mod fakes;
pub mod harness;
pub mod port;
pub mod wait;
