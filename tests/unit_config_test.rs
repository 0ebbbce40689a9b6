use bluse_coordinator::config::Config;
use std::fs;
use std::path::PathBuf;

fn write_config(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("coordinator-test-{}-{name}", std::process::id()));
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_full_config_parses() {
    let path = write_config(
        "full.yml",
        r#"
redis_host: 10.98.81.254
redis_port: 6379
channels:
  - sensor_alerts
  - rec_result
  - proc_result
hashpipe_instances:
  - blpn0/0
  - blpn0/1
arrays:
  - array_1
  - array_2
streams_per_instance: 4
gateway_domain: bluse
telescope_name: MeerKAT
"#,
    );
    let config = Config::from_file(path.to_str().unwrap()).unwrap();
    assert_eq!(config.redis_addr(), "10.98.81.254:6379");
    assert_eq!(config.arrays, ["array_1", "array_2"]);
    assert_eq!(config.instances().len(), 2);
    assert_eq!(config.streams_per_instance, 4);
    fs::remove_file(path).ok();
}

#[test]
fn test_defaults_fill_optional_fields() {
    let path = write_config(
        "minimal.yml",
        r#"
hashpipe_instances:
  - blpn0/0
arrays:
  - array_1
"#,
    );
    let config = Config::from_file(path.to_str().unwrap()).unwrap();
    assert_eq!(config.redis_host, "127.0.0.1");
    assert_eq!(config.redis_port, 6379);
    assert_eq!(config.gateway_domain, "bluse");
    assert_eq!(config.telescope_name, "MeerKAT");
    assert_eq!(config.streams_per_instance, 4);
    assert!(!config.channels.is_empty());
    fs::remove_file(path).ok();
}

#[test]
fn test_empty_instances_rejected() {
    let path = write_config(
        "noinst.yml",
        r#"
hashpipe_instances: []
arrays:
  - array_1
"#,
    );
    assert!(Config::from_file(path.to_str().unwrap()).is_err());
    fs::remove_file(path).ok();
}

#[test]
fn test_malformed_instance_names_rejected() {
    let path = write_config(
        "badinst.yml",
        r#"
hashpipe_instances:
  - blpn0
arrays:
  - array_1
"#,
    );
    assert!(Config::from_file(path.to_str().unwrap()).is_err());
    fs::remove_file(path).ok();
}

#[test]
fn test_missing_file_is_an_error() {
    assert!(Config::from_file("/nonexistent/config.yml").is_err());
}
