// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! JSON-RPC 2.0 over AMQP: a correlating client, the method registry and the
//! handler answering requests from a worker.

pub mod client;
pub mod evaluator;
pub mod jsonrpc;
pub mod server;

pub use client::RpcClient;
pub use evaluator::{Evaluator, Procedure, Target};
pub use server::RequestHandler;
