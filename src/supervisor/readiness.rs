//! 就绪探测：固定延迟 / 端口可连接 / HTTP 健康检查

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout_at, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 进程启动后判断「已就绪」的方式
#[derive(Debug, Clone)]
pub enum ReadinessProbe {
    /// 启动后等待固定时长即视为就绪
    Delay(Duration),
    /// 轮询直到端口可连接
    Port { host: String, port: u16 },
    /// 轮询直到 GET 返回 2xx
    Health { url: String },
}

impl ReadinessProbe {
    /// 在 timeout 内等待就绪；超时返回失败原因
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), String> {
        let deadline = Instant::now() + timeout;
        match self {
            ReadinessProbe::Delay(delay) => {
                if *delay > timeout {
                    sleep(timeout).await;
                    return Err(format!(
                        "readiness delay {:?} exceeds startup timeout {:?}",
                        delay, timeout
                    ));
                }
                sleep(*delay).await;
                Ok(())
            }
            ReadinessProbe::Port { host, port } => {
                let addr = format!("{host}:{port}");
                loop {
                    // 单次连接也受总期限约束
                    if let Ok(Ok(_)) = timeout_at(deadline, TcpStream::connect(&addr)).await {
                        tracing::debug!(%addr, "backend port is ready");
                        return Ok(());
                    }
                    if Instant::now() >= deadline {
                        return Err(format!("port {addr} not ready within {:?}", timeout));
                    }
                    sleep(POLL_INTERVAL).await;
                }
            }
            ReadinessProbe::Health { url } => {
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(2))
                    .build()
                    .map_err(|e| format!("health client build failed: {e}"))?;
                loop {
                    match timeout_at(deadline, client.get(url).send()).await {
                        Ok(Ok(resp)) if resp.status().is_success() => {
                            tracing::debug!(%url, "backend health probe passed");
                            return Ok(());
                        }
                        Ok(Ok(resp)) => {
                            tracing::trace!(%url, status = %resp.status(), "health probe not ready");
                        }
                        Ok(Err(e)) => {
                            tracing::trace!(%url, "health probe error: {e}");
                        }
                        Err(_) => {
                            tracing::trace!(%url, "health probe cut off at deadline");
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(format!("health check {url} not passing within {:?}", timeout));
                    }
                    sleep(POLL_INTERVAL).await;
                }
            }
        }
    }
}
