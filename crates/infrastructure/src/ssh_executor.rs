//! 基于 ssh/scp 的远程执行器
//!
//! 每次调用启动一个 `ssh` 或 `scp` 子进程，依赖账户预先配置好的免密登录。

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use scheduler_config::RemoteConfig;
use scheduler_domain::{Account, Host, QueueSystem, RemoteExecutor};
use scheduler_errors::{SchedulerError, SchedulerResult};

pub struct SshRemoteExecutor {
    config: RemoteConfig,
}

impl SshRemoteExecutor {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    fn target(account: &Account, host: &Host) -> String {
        format!("{}@{}", account.username, host.address)
    }

    fn ssh_command(&self, account: &Account, host: &Host, remote_command: &str) -> Command {
        let mut cmd = Command::new(&self.config.ssh_command);
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_seconds))
            .arg(Self::target(account, host))
            .arg(remote_command);
        cmd
    }

    fn scp_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.scp_command);
        cmd.arg("-q")
            .arg("-r")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_seconds));
        cmd
    }

    /// 运行子进程，非零退出码视为失败
    async fn run(&self, operation: &str, mut cmd: Command) -> SchedulerResult<String> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.command_timeout_seconds);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| {
                SchedulerError::remote(operation, format!("超时 ({}秒)", timeout.as_secs()))
            })?
            .map_err(|e| SchedulerError::remote(operation, format!("无法启动进程: {e}")))?;

        debug!(
            "远程操作 {} 完成，耗时 {:?}，退出码 {:?}",
            operation,
            started.elapsed(),
            output.status.code()
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SchedulerError::remote(
                operation,
                format!("退出码 {:?}: {}", output.status.code(), stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// 单引号转义，供远程 shell 使用
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// scp 远程路径允许的字符
///
/// OpenSSH 9 起 scp 默认走 SFTP 协议，远程路径不经过远程 shell，引号会成为路径的一部分。
fn is_plain_remote_path(path: &str) -> bool {
    !path.is_empty()
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/_-.:=+,@%".contains(c))
}

/// 构造 scp 的远程参数 `user@host:run_path/suffix`，路径不加引号
pub fn scp_remote(
    account: &Account,
    host: &Host,
    run_path: &str,
    suffix: &str,
) -> SchedulerResult<String> {
    if !is_plain_remote_path(run_path) {
        return Err(SchedulerError::misconfigured(format!(
            "远程路径包含不支持的字符: {run_path}"
        )));
    }
    Ok(format!(
        "{}:{}/{}",
        SshRemoteExecutor::target(account, host),
        run_path,
        suffix
    ))
}

/// 从提交命令的输出中解析队列id
pub fn parse_submit_output(queue_system: QueueSystem, stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    match queue_system {
        // "Submitted batch job 12345"
        QueueSystem::Slurm => line
            .split_whitespace()
            .last()
            .filter(|id| id.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string),
        // "12345.quser01"
        QueueSystem::Pbs => line
            .split('.')
            .next()
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string),
    }
}

/// 解析队列列表中的作业id
pub fn parse_queue_listing(queue_system: QueueSystem, stdout: &str) -> HashSet<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|token| match queue_system {
            QueueSystem::Slurm => Some(token),
            QueueSystem::Pbs => token.split('.').next(),
        })
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

fn listing_command(queue_system: QueueSystem) -> &'static str {
    match queue_system {
        QueueSystem::Slurm => "squeue -h -o %i",
        QueueSystem::Pbs => "qstat",
    }
}

#[async_trait]
impl RemoteExecutor for SshRemoteExecutor {
    async fn submit(
        &self,
        account: &Account,
        host: &Host,
        source: &Path,
        run_path: &str,
        script: &str,
    ) -> SchedulerResult<String> {
        let mkdir = format!("mkdir -p {}", shell_quote(run_path));
        self.run("submit", self.ssh_command(account, host, &mkdir))
            .await?;

        let mut entries = tokio::fs::read_dir(source).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            files.push(entry.path());
        }
        if files.is_empty() {
            return Err(SchedulerError::remote(
                "submit",
                format!("本地目录为空: {}", source.display()),
            ));
        }

        let mut scp = self.scp_command();
        scp.args(&files)
            .arg(scp_remote(account, host, run_path, "")?);
        self.run("submit", scp).await?;

        let submit = format!(
            "cd {} && {} {}",
            shell_quote(run_path),
            host.queue_system.submit_command(),
            shell_quote(script)
        );
        let stdout = self
            .run("submit", self.ssh_command(account, host, &submit))
            .await?;

        parse_submit_output(host.queue_system, &stdout).ok_or_else(|| {
            SchedulerError::remote("submit", format!("无法解析提交输出: {}", stdout.trim()))
        })
    }

    async fn list_running(&self, account: &Account, host: &Host) -> SchedulerResult<HashSet<String>> {
        let stdout = self
            .run(
                "list_running",
                self.ssh_command(account, host, listing_command(host.queue_system)),
            )
            .await?;
        Ok(parse_queue_listing(host.queue_system, &stdout))
    }

    async fn move_files(
        &self,
        account: &Account,
        host: &Host,
        run_path: &str,
        destination: &Path,
        pattern: &str,
        remove_source: bool,
    ) -> SchedulerResult<()> {
        tokio::fs::create_dir_all(destination).await?;

        let mut scp = self.scp_command();
        scp.arg(scp_remote(account, host, run_path, pattern)?)
            .arg(destination);
        self.run("move_files", scp).await?;

        if remove_source {
            let rm = format!("rm -rf {}/{}", shell_quote(run_path), pattern);
            self.run("move_files", self.ssh_command(account, host, &rm))
                .await?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        account: &Account,
        host: &Host,
        command: &str,
        ignore_failure: bool,
    ) -> SchedulerResult<String> {
        match self
            .run("execute", self.ssh_command(account, host, command))
            .await
        {
            Ok(stdout) => Ok(stdout),
            Err(e) if ignore_failure => {
                warn!("忽略远程命令失败 ({}): {}", command, e);
                Ok(String::new())
            }
            Err(e) => Err(e),
        }
    }
}
