use crate::config::{Config, PromptConfig, RunConfig};
use crate::error::MatrixError;
use crate::result::ResultSet;
use crate::scheduler::run_cell;
use crate::variant::TargetVariant;
use tracing::{info, warn};

/// Where a variant's concurrency levels came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelSource {
    Variant,
    GlobalList,
    GlobalSingle,
}

/// Global concurrency settings used for variants without an override.
#[derive(Debug, Clone)]
pub struct GlobalLevels {
    pub levels: Vec<usize>,
    pub concurrency: usize,
}

impl GlobalLevels {
    /// Resolve a variant's levels: its own override, else the global list,
    /// else the single global concurrency value.
    pub fn resolve(&self, variant: &TargetVariant) -> (Vec<usize>, LevelSource) {
        match &variant.concurrency_levels {
            Some(levels) if !levels.is_empty() => (levels.clone(), LevelSource::Variant),
            _ if !self.levels.is_empty() => (self.levels.clone(), LevelSource::GlobalList),
            _ => (vec![self.concurrency], LevelSource::GlobalSingle),
        }
    }
}

/// Runs every (variant, concurrency) cell strictly one after another.
pub struct MatrixDriver {
    run: RunConfig,
    prompt: PromptConfig,
    levels: GlobalLevels,
    variants: Vec<TargetVariant>,
}

impl MatrixDriver {
    pub fn new(
        run: RunConfig,
        prompt: PromptConfig,
        levels: GlobalLevels,
        variants: Vec<TargetVariant>,
    ) -> Self {
        Self {
            run,
            prompt,
            levels,
            variants,
        }
    }

    pub fn from_config(config: &Config, variants: Vec<TargetVariant>) -> Self {
        Self::new(
            config.test.run_config(),
            config.prompt.clone(),
            GlobalLevels {
                levels: config.test.concurrency_levels.clone(),
                concurrency: config.test.concurrency,
            },
            variants,
        )
    }

    /// The cells a run would execute, in execution order.
    pub fn plan(&self) -> Vec<(String, Vec<usize>)> {
        self.variants
            .iter()
            .map(|v| (v.name.clone(), self.levels.resolve(v).0))
            .collect()
    }

    pub fn variants(&self) -> &[TargetVariant] {
        &self.variants
    }

    /// Run the whole matrix. The first cell-fatal error aborts the run and
    /// no partial results are returned.
    pub async fn run(&self) -> Result<ResultSet, MatrixError> {
        let mut results = ResultSet::new();

        for variant in &self.variants {
            let (levels, source) = self.levels.resolve(variant);
            info!(
                "Testing {} at concurrency levels {:?} ({:?})",
                variant.name, levels, source
            );

            for concurrency in levels {
                let cell = run_cell(variant, concurrency, &self.run, &self.prompt)
                    .await
                    .map_err(|source| MatrixError {
                        variant: variant.name.clone(),
                        concurrency,
                        source,
                    })?;

                if results.insert(cell).is_some() {
                    warn!(
                        "Cell ({}, {}) ran twice, keeping the latest result",
                        variant.name, concurrency
                    );
                }
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CellError, InvokeError};
    use crate::invoker::{Completion, InvokeFuture, InvokeRequest, Invoker, MockInvoker};
    use std::sync::Arc;
    use std::time::Duration;

    fn mock() -> Arc<dyn Invoker> {
        Arc::new(MockInvoker::new(Duration::from_millis(2)))
    }

    fn driver(variants: Vec<TargetVariant>) -> MatrixDriver {
        MatrixDriver::new(
            RunConfig {
                duration: Duration::from_millis(50),
                ..RunConfig::default()
            },
            PromptConfig {
                system_message: String::new(),
                user_message: "hi".into(),
                stream: false,
            },
            GlobalLevels {
                levels: vec![10, 20, 50],
                concurrency: 1,
            },
            variants,
        )
    }

    struct FaultyInvoker;

    impl Invoker for FaultyInvoker {
        fn name(&self) -> &'static str {
            "faulty"
        }

        fn invoke<'a>(&'a self, _request: &'a InvokeRequest) -> InvokeFuture<'a> {
            Box::pin(async move { explode() })
        }
    }

    fn explode() -> Result<Completion, InvokeError> {
        panic!("target fault")
    }

    #[test]
    fn test_level_precedence() {
        let globals = GlobalLevels {
            levels: vec![10, 20, 50],
            concurrency: 4,
        };
        let own = TargetVariant::new("own", mock()).with_levels(vec![5, 10]);
        let inherit = TargetVariant::new("inherit", mock());
        let empty = TargetVariant::new("empty", mock()).with_levels(vec![]);

        assert_eq!(globals.resolve(&own), (vec![5, 10], LevelSource::Variant));
        assert_eq!(
            globals.resolve(&inherit),
            (vec![10, 20, 50], LevelSource::GlobalList)
        );
        assert_eq!(
            globals.resolve(&empty),
            (vec![10, 20, 50], LevelSource::GlobalList)
        );

        let single = GlobalLevels {
            levels: vec![],
            concurrency: 4,
        };
        assert_eq!(single.resolve(&inherit), (vec![4], LevelSource::GlobalSingle));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runs_exactly_the_resolved_cells() {
        let driver = driver(vec![
            TargetVariant::new("own", mock()).with_levels(vec![5, 10]),
            TargetVariant::new("inherit", mock()),
        ]);

        assert_eq!(
            driver.plan(),
            vec![
                ("own".to_string(), vec![5, 10]),
                ("inherit".to_string(), vec![10, 20, 50]),
            ]
        );

        let results = driver.run().await.unwrap();
        let keys: Vec<_> = results
            .keys()
            .map(|k| (k.variant, k.concurrency))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("own".to_string(), 5),
                ("own".to_string(), 10),
                ("inherit".to_string(), 10),
                ("inherit".to_string(), 20),
                ("inherit".to_string(), 50),
            ]
        );
        for cell in results.iter() {
            assert_eq!(cell.success_requests + cell.failed_requests, cell.total_requests);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_levels_overwrite() {
        let driver = driver(vec![
            TargetVariant::new("dup", mock()).with_levels(vec![2, 2])
        ]);
        let results = driver.run().await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results.get("dup", 2).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cell_fault_aborts_matrix() {
        let driver = driver(vec![
            TargetVariant::new("healthy", mock()).with_levels(vec![1]),
            TargetVariant::new("broken", Arc::new(FaultyInvoker)).with_levels(vec![2]),
            TargetVariant::new("never", mock()).with_levels(vec![1]),
        ]);

        let err = driver.run().await.unwrap_err();
        assert_eq!(err.variant, "broken");
        assert_eq!(err.concurrency, 2);
        assert!(matches!(err.source, CellError::WorkerPanicked(_)));
        assert!(err.to_string().contains("broken"));
    }
}
