//! End-to-end sync scenarios against an in-memory backend and push channel.

mod scenarios;
mod support;
