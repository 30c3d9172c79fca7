#![cfg(test)]
//! Shared test fixtures: a non-default `Options` builder and bearer-token
//! helpers, so integration tests don't each hand-roll the clap parse dance.

use clap::Parser;

use crate::Options;

pub const TEST_SECRET: &str = "test-secret";

#[must_use]
pub fn test_options() -> Options {
    let args: Vec<&str> = vec![
        "session-arena",
        "--shared-secret",
        TEST_SECRET,
        "--bind",
        "127.0.0.1:0",
    ];
    Options::parse_from(args)
}

#[must_use]
pub fn bearer_token(user_id: &str) -> String {
    format!("{TEST_SECRET}:{user_id}")
}

#[must_use]
pub fn admin_bearer_token(user_id: &str) -> String {
    format!("{TEST_SECRET}:{user_id}:admin")
}
