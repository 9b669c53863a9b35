#![allow(dead_code)]

pub mod app;
pub mod fakes;
pub mod http;
