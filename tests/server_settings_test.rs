use nftvpn::config::{BackendKind, ConfigError, ServerSettings};
use std::env;
use std::time::Duration;

const REQUIRED: [(&str, &str); 3] = [
    ("TOKEN_CONTRACT", "0x2222222222222222222222222222222222222222"),
    (
        "SERVER_PUBLIC_KEY",
        "AgICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgI=",
    ),
    ("SERVER_ENDPOINT", "203.0.113.7:51820"),
];

// Everything from_env reads in this test; saved and restored around it.
const TOUCHED: [&str; 6] = [
    "TOKEN_CONTRACT",
    "SERVER_PUBLIC_KEY",
    "SERVER_ENDPOINT",
    "TUNNEL_NETWORK",
    "TUNNEL_BACKEND",
    "SESSION_TTL_PAID_SECS",
];

#[test]
fn test_server_settings_from_env() {
    let original: Vec<(&str, Option<String>)> =
        TOUCHED.iter().map(|k| (*k, env::var(k).ok())).collect();

    for (k, v) in REQUIRED {
        env::set_var(k, v);
    }
    env::set_var("TUNNEL_NETWORK", "10.66.0.0/28");
    env::set_var("TUNNEL_BACKEND", "memory");
    env::set_var("SESSION_TTL_PAID_SECS", "7200");

    let settings = ServerSettings::from_env().unwrap();
    assert_eq!(settings.tunnel_network.to_string(), "10.66.0.0/28");
    assert_eq!(settings.tunnel_network.client_capacity(), 13);
    assert_eq!(settings.tunnel_backend, BackendKind::Memory);
    assert_eq!(settings.session_ttl_paid, Duration::from_secs(7200));
    assert_eq!(settings.server_endpoint, "203.0.113.7:51820");

    // Without the contract the gateway refuses to start.
    env::remove_var("TOKEN_CONTRACT");
    assert_eq!(
        ServerSettings::from_env().unwrap_err(),
        ConfigError::Missing("TOKEN_CONTRACT")
    );

    for (k, v) in original {
        match v {
            Some(v) => env::set_var(k, v),
            None => env::remove_var(k),
        }
    }
}

#[test]
fn test_server_settings_reject_bad_peer_key() {
    let result = ServerSettings::from_lookup(|name| match name {
        "TOKEN_CONTRACT" => Some(REQUIRED[0].1.to_string()),
        "SERVER_PUBLIC_KEY" => Some("not-a-wireguard-key".to_string()),
        "SERVER_ENDPOINT" => Some(REQUIRED[2].1.to_string()),
        _ => None,
    });
    assert!(matches!(
        result,
        Err(ConfigError::Invalid {
            name: "SERVER_PUBLIC_KEY",
            ..
        })
    ));
}
