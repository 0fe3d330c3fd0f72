// Node service main entry point.
mod observability;

use anyhow::Result;
use ripple_node::config::NodeConfig;
use ripple_node::demo::Demo;
use std::future::Future;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("ripple-node")?;
    let config = NodeConfig::from_env_or_yaml(None)?;

    let metrics_bind = config.metrics_bind;
    let metrics_task = tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics listener exited");
        }
    });

    let demo = Demo::start(&config).await?;
    tracing::info!(table = %demo.table(), "node started");

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    demo.shutdown().await;
    metrics_task.abort();
    tracing::info!("node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_stops_cleanly() -> Result<()> {
        let _g1 = EnvGuard::set("RIPPLE_METRICS_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::set("RIPPLE_WRITE_INTERVAL_MS", "5");
        let _g3 = EnvGuard::unset("RIPPLE_NODE_CONFIG");
        run_with_shutdown(tokio::time::sleep(std::time::Duration::from_millis(50))).await
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_rejects_bad_config() {
        let _g1 = EnvGuard::set("RIPPLE_METRICS_BIND", "127.0.0.1:0");
        let _g2 = EnvGuard::set("RIPPLE_NODE_CONFIG", "/definitely/not/here.yaml");
        assert!(run_with_shutdown(async {}).await.is_err());
    }
}
