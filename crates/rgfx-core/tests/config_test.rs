//! Integration test: rgfx.toml parsing
//!
//! Run with: cargo test -p rgfx-core --test config_test

use rgfx_core::scheduler::SchedulerConfig;
use rgfx_core::staging::StagingConfig;
use rgfx_core::{GfxError, RgfxConfig};

#[test]
fn test_defaults_are_valid() {
    let config = RgfxConfig::default();
    config.validate().expect("defaults validate");
    assert_eq!(config.server.port, 9877);
    assert_eq!(config.graphics.max_frames, 2);
    assert_eq!(config.client.address, "127.0.0.1:9877");
}

#[test]
fn test_partial_file_fills_defaults() {
    let config = RgfxConfig::parse(
        r#"
        [server]
        port = 7000

        [graphics]
        max_frames = 3
        dynamic_block_size = 1048576
        "#,
    )
    .expect("parse");
    assert_eq!(config.server.port, 7000);
    assert_eq!(config.server.bind, "0.0.0.0");
    assert_eq!(config.graphics.max_frames, 3);
    assert_eq!(config.graphics.max_pending_batches, 16);

    let sched = SchedulerConfig::from(&config.graphics);
    assert_eq!(sched.max_frames, 3);
    let staging = StagingConfig::from(&config.graphics);
    assert_eq!(staging.dynamic_block_size, 1 << 20);
}

#[test]
fn test_rejects_out_of_range_values() {
    for bad in [
        "[graphics]\nmax_frames = 0",
        "[graphics]\nmax_frames = 9",
        "[graphics]\nmax_pending_batches = 0",
        "[graphics]\ndynamic_block_size = 4096\nmax_dynamic_size = 1024",
        "[client]\nchannels = 0",
    ] {
        match RgfxConfig::parse(bad) {
            Err(GfxError::Config(_)) => {}
            other => panic!("{:?} was accepted: {:?}", bad, other.map(|_| ())),
        }
    }
}

#[test]
fn test_malformed_toml_is_config_error() {
    assert!(matches!(RgfxConfig::parse("[server\nport = 1"), Err(GfxError::Config(_))));
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let config = RgfxConfig::load_or_default("/nonexistent/rgfx.toml");
    assert_eq!(config.server.channels, 3);
}
