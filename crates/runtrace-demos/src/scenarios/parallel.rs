use std::time::Duration;

use async_trait::async_trait;
use runtrace_core::prelude::*;

/// Squares `width` consecutive numbers concurrently, one child run each, and
/// streams the results in input order.
pub struct FanOut {
    pub width: i64,
}

fn square_unit() -> impl Runnable<Input = i64, Output = i64> {
    RunnableLambda::new("square", |n: i64| async move {
        tokio::time::sleep(Duration::from_millis((n.rem_euclid(4) * 3) as u64)).await;
        Ok::<_, UnitError>(n * n)
    })
    .with_kind(RunKind::Tool)
}

#[async_trait]
impl Runnable for FanOut {
    type Input = i64;
    type Output = Vec<i64>;

    fn name(&self) -> String {
        "fan_out".into()
    }

    async fn run(&self, start: i64, run: &mut RunHandle<Vec<i64>>) -> Result<Option<Vec<i64>>, UnitError> {
        let tasks: Vec<_> = (0..self.width)
            .map(|i| {
                let ctx = run.context();
                tokio::spawn(async move {
                    ctx.invoke(
                        &square_unit(),
                        start + i,
                        RunConfig::new().with_metadata("slot", i),
                    )
                    .await
                })
            })
            .collect();
        for task in tasks {
            let square = task
                .await
                .map_err(|e| UnitError::failed(format!("square task panicked: {e}")))??
                .unwrap_or_default();
            run.stream(vec![square]).await?;
        }
        Ok(None)
    }
}
