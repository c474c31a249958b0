// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Resilience Layer
//!
//! Client-side reliability on top of AMQP: self-healing connection and
//! channel lifecycles, publishing with confirms and bounded retry, and a
//! subscriber engine that routes failed deliveries through a delay queue
//! before dead-lettering them.

pub mod channel;
pub mod config;
pub mod connection;
pub mod errors;
pub mod headers;
pub mod publisher;
pub mod subscriber;
