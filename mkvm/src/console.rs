use async_trait::async_trait;
use mkvm_vm::{Operator, Plan};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::info;

const PROMPT: &str = "press enter if this looks okay:";

/// Shows the plan and waits for the operator to hit enter. Interrupting the
/// process is the only way to back out.
pub struct ConsoleOperator<R, W> {
    input: BufReader<R>,
    output: W,
}

impl ConsoleOperator<tokio::io::Stdin, tokio::io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R, W> ConsoleOperator<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(input: R, output: W) -> Self {
        Self {
            input: BufReader::new(input),
            output,
        }
    }
}

fn log_plan(plan: &Plan) {
    info!("plan:");
    info!("name: {}", plan.vm_name);
    info!("distro: {}", plan.distro);
    info!("zvol: {} ({} GB)", plan.dataset, plan.size_gb);
    info!("base image url: {}", plan.image_url);
    info!("mac address: {}", plan.mac);
    info!("ram: {} MB", plan.memory_mb);
}

#[async_trait]
impl<R, W> Operator for ConsoleOperator<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn confirm(&mut self, plan: &Plan) -> std::io::Result<()> {
        log_plan(plan);

        self.output.write_all(PROMPT.as_bytes()).await?;
        self.output.flush().await?;

        // Any line, or end of input, counts as a yes.
        let mut line = String::new();
        self.input.read_line(&mut line).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mkvm_vm::MacAddress;
    use std::path::PathBuf;

    fn plan() -> Plan {
        Plan {
            vm_name: "test1".into(),
            distro: "alpine-edge".into(),
            dataset: "rpool/mkvm-test/test1".into(),
            device_path: PathBuf::from("/dev/zvol/rpool/mkvm-test/test1"),
            size_gb: 4,
            image_url: "https://example.com/alpine.qcow2".into(),
            mac: MacAddress::from([0x52, 0x54, 0x00, 0x0a, 0xbc, 0x01]),
            memory_mb: 512,
        }
    }

    #[tokio::test]
    async fn prompts_and_waits_for_a_line() {
        let input: &[u8] = b"\nleftover";
        let mut output = Vec::new();
        let mut operator = ConsoleOperator::new(input, &mut output);

        operator.confirm(&plan()).await.unwrap();

        drop(operator);
        assert_eq!(String::from_utf8(output).unwrap(), PROMPT);
    }

    #[tokio::test]
    async fn end_of_input_proceeds() {
        let input: &[u8] = b"";
        let mut operator = ConsoleOperator::new(input, Vec::new());
        assert!(operator.confirm(&plan()).await.is_ok());
    }
}
