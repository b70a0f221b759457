#![allow(dead_code)]

pub mod assertions;
pub mod engine;
pub mod harness;
pub mod vectors;
