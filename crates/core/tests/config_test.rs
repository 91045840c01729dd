use std::io::Write;

use lessonforge_core::AppConfig;
use tempfile::NamedTempFile;

#[test]
fn test_default_config_is_valid() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.worker.max_concurrent_tasks, 2);
    assert_eq!(config.message_queue.max_retries, 3);
    assert_eq!(config.message_queue.prefetch_count, 8);
}

#[test]
fn test_from_toml_overrides() {
    let toml_str = r#"
[message_queue]
url = "amqp://mq.internal:5672"
task_exchange = "lesson.tasks"
task_queue = "lesson_tasks"
task_routing_key = "lesson.task"
dead_letter_exchange = "lesson.tasks.dlx"
dead_letter_queue = "lesson_tasks_dead"
dead_letter_routing_key = "lesson.task.dead"
prefetch_count = 16
max_retries = 5
connection_timeout_seconds = 10

[worker]
worker_id = "worker-a1"
max_concurrent_tasks = 4
shutdown_grace_seconds = 15
dlq_monitor_enabled = false
dlq_check_interval_seconds = 60
dlq_alert_threshold = 20

[services]
content_service_url = "http://content.internal:8081"
media_service_url = "http://media.internal:8082"
request_timeout_seconds = 120
"#;

    let config = AppConfig::from_toml(toml_str).unwrap();
    assert_eq!(config.message_queue.url, "amqp://mq.internal:5672");
    assert_eq!(config.message_queue.max_retries, 5);
    assert_eq!(config.worker.worker_id, "worker-a1");
    assert_eq!(config.worker.max_concurrent_tasks, 4);
    assert!(!config.worker.dlq_monitor_enabled);
    assert_eq!(config.services.request_timeout_seconds, 120);
}

#[test]
fn test_invalid_amqp_url_is_rejected() {
    let mut config = AppConfig::default();
    config.message_queue.url = "redis://localhost:6379".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_zero_concurrency_is_rejected() {
    let mut config = AppConfig::default();
    config.worker.max_concurrent_tasks = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_zero_prefetch_is_rejected() {
    let mut config = AppConfig::default();
    config.message_queue.prefetch_count = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_service_url_must_be_http() {
    let mut config = AppConfig::default();
    config.services.media_service_url = "ftp://media.internal".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_load_from_config_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[worker]
worker_id = "worker-from-file"
max_concurrent_tasks = 3
"#
    )
    .unwrap();

    let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
    // 文件覆盖默认值，未给出的字段保持默认
    assert_eq!(config.worker.worker_id, "worker-from-file");
    assert_eq!(config.worker.max_concurrent_tasks, 3);
    assert_eq!(config.message_queue.task_queue, "lesson_tasks");
}

#[test]
fn test_load_missing_config_file_fails() {
    let result = AppConfig::load(Some("/nonexistent/lessonforge.toml"));
    assert!(result.is_err());
}
