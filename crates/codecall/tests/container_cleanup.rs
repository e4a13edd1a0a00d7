//! Integration tests for container cleanup
//!
//! Run with: cargo test -p codecall --test container_cleanup -- --ignored
//!
//! Requirements:
//! - A Docker daemon reachable with the local defaults
//! - Permission to pull `busybox:latest`

use bollard::query_parameters::InspectContainerOptions;
use bollard::Docker;
use uuid::Uuid;

use codecall::backend::{ContainerLauncher, ContainerRuntime, Launcher};
use codecall::Config;

fn busybox_config() -> Config {
    Config {
        executor_image_repository: Some("busybox".to_string()),
        executor_image_tag: "latest".to_string(),
        ..Config::default()
    }
}

async fn container_exists(docker: &Docker, name: &str) -> bool {
    docker
        .inspect_container(name, None::<InspectContainerOptions>)
        .await
        .is_ok()
}

#[tokio::test]
#[ignore] // Requires a Docker daemon
async fn test_teardown_leaves_no_container() {
    let docker = Docker::connect_with_local_defaults().expect("connect to Docker");
    let runtime = ContainerRuntime::connect(&busybox_config()).expect("container runtime");
    let mut launcher = ContainerLauncher::new(runtime);
    let worker_id = Uuid::now_v7();
    let name = format!("codecall.worker.{worker_id}");

    // Whether or not the container starts, it must not outlive teardown
    let launched = launcher.launch(worker_id).await;
    if launched.is_err() {
        assert!(!container_exists(&docker, &name).await);
    }
    launcher.teardown().await;

    assert!(!container_exists(&docker, &name).await);
}
