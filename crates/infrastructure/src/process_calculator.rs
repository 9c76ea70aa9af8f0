//! 通过外部命令调用计算函数
//!
//! 请求以 JSON 写入子进程标准输入，子进程在标准输出返回 `CalculationResult` 的 JSON。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use scheduler_config::CalculationConfig;
use scheduler_domain::{CalculationResult, Calculator, Entity, Parameters};
use scheduler_errors::{SchedulerError, SchedulerResult};

#[derive(Debug, Serialize)]
struct CalculationRequest<'a> {
    module: &'a str,
    entity: &'a Entity,
    parameters: &'a Parameters,
}

pub struct ProcessCalculator {
    config: CalculationConfig,
}

impl ProcessCalculator {
    pub fn new(config: CalculationConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Calculator for ProcessCalculator {
    async fn compute(
        &self,
        module: &str,
        entity: &Entity,
        parameters: &Parameters,
    ) -> SchedulerResult<CalculationResult> {
        let request = serde_json::to_vec(&CalculationRequest {
            module,
            entity,
            parameters,
        })?;

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SchedulerError::Internal(format!(
                    "无法启动计算命令 {}: {}",
                    self.config.command, e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&request).await?;
            stdin.shutdown().await?;
        }

        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| SchedulerError::Timeout(format!("计算模块 {module} 超时")))??;

        if !output.status.success() {
            return Err(SchedulerError::Internal(format!(
                "计算模块 {} 执行失败: {}",
                module,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let result: CalculationResult = serde_json::from_slice(&output.stdout)?;
        debug!(
            "计算模块 {} 返回: kind={}, converged={}, 指令数={}",
            module,
            result.kind,
            result.converged,
            result.instructions.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn entity() -> Entity {
        Entity {
            id: 42,
            name: "Fe2O3".to_string(),
            root_path: PathBuf::from("/data/entries/42"),
            workload_size: 10,
            holds: vec![],
            project_ids: BTreeSet::from([1]),
        }
    }

    fn shell(script: &str) -> ProcessCalculator {
        ProcessCalculator::new(CalculationConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            timeout_seconds: 30,
        })
    }

    #[tokio::test]
    async fn test_process_calculator_parses_result() {
        let calculator = shell(
            r#"cat > /dev/null; echo '{"kind":"static","converged":false,"instructions":{"serial":false,"binary":"vasp_53"}}'"#,
        );
        let result = calculator
            .compute("static", &entity(), &Parameters::new())
            .await
            .unwrap();
        assert_eq!(result.kind, "static");
        assert!(!result.converged);
        assert_eq!(result.instructions["binary"], "vasp_53");
    }

    #[tokio::test]
    async fn test_process_calculator_reports_failure() {
        let calculator = shell("cat > /dev/null; echo boom >&2; exit 3");
        let err = calculator
            .compute("static", &entity(), &Parameters::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Internal(ref m) if m.contains("boom")));
    }

    #[tokio::test]
    async fn test_process_calculator_rejects_garbage() {
        let calculator = shell("cat > /dev/null; echo not-json");
        let err = calculator
            .compute("static", &entity(), &Parameters::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Serialization(_)));
    }
}
