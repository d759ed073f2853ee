use std::collections::HashMap;
use std::sync::Arc;

use scheduler_errors::{SchedulerError, SchedulerResult};
use tracing::{debug, info};

use super::QueueProvider;

/// 队列名到队列提供者的映射
///
/// 未显式注册的队列由默认提供者负责。映射在启动时建立, 之后只读。
#[derive(Clone)]
pub struct QueueProviderRegistry {
    default_provider: Arc<dyn QueueProvider>,
    providers: HashMap<String, Arc<dyn QueueProvider>>,
}

impl QueueProviderRegistry {
    pub fn new(default_provider: Arc<dyn QueueProvider>) -> Self {
        Self {
            default_provider,
            providers: HashMap::new(),
        }
    }

    /// 让 `provider` 负责给定的队列
    pub fn register<S: AsRef<str>>(&mut self, provider: Arc<dyn QueueProvider>, queues: &[S]) -> SchedulerResult<()> {
        if queues.is_empty() {
            return Err(SchedulerError::invalid_argument("注册队列提供者时队列列表不能为空"));
        }
        for queue in queues {
            let queue = queue.as_ref();
            if queue.trim().is_empty() {
                return Err(SchedulerError::invalid_argument("队列名不能为空"));
            }
            if let Some(existing) = self.providers.get(queue) {
                if !same_provider(existing, &provider) {
                    return Err(SchedulerError::config_error(format!(
                        "队列 {} 已经由提供者 {} 负责",
                        queue,
                        existing.name()
                    )));
                }
            }
        }

        for queue in queues {
            self.providers.insert(queue.as_ref().to_string(), provider.clone());
        }
        info!(
            provider = provider.name(),
            queues = ?queues.iter().map(AsRef::as_ref).collect::<Vec<_>>(),
            "queue provider registered"
        );
        Ok(())
    }

    pub fn default_provider(&self) -> &Arc<dyn QueueProvider> {
        &self.default_provider
    }

    pub fn provider_for(&self, queue: &str) -> &Arc<dyn QueueProvider> {
        self.providers.get(queue).unwrap_or(&self.default_provider)
    }

    /// 找出负责所有给定队列的唯一提供者
    ///
    /// 队列列表为空返回 `InvalidArgument`, 涉及多个提供者返回 `AmbiguousQueueProvider`。
    pub fn resolve_single<S: AsRef<str>>(&self, queues: &[S]) -> SchedulerResult<Arc<dyn QueueProvider>> {
        let Some(first) = queues.first() else {
            return Err(SchedulerError::invalid_argument("队列列表不能为空"));
        };

        let selected = self.provider_for(first.as_ref());
        if queues
            .iter()
            .any(|queue| !same_provider(self.provider_for(queue.as_ref()), selected))
        {
            return Err(SchedulerError::AmbiguousQueueProvider {
                queues: queues.iter().map(|q| q.as_ref().to_string()).collect(),
            });
        }

        debug!(provider = selected.name(), "queue provider resolved");
        Ok(selected.clone())
    }

    /// 所有不同的提供者, 默认提供者在前
    pub fn providers(&self) -> Vec<Arc<dyn QueueProvider>> {
        let mut distinct: Vec<Arc<dyn QueueProvider>> = vec![self.default_provider.clone()];
        for provider in self.providers.values() {
            if !distinct.iter().any(|p| same_provider(p, provider)) {
                distinct.push(provider.clone());
            }
        }
        distinct
    }
}

fn same_provider(a: &Arc<dyn QueueProvider>, b: &Arc<dyn QueueProvider>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobQueue, QueueMonitoring};

    struct NamedProvider(&'static str);

    impl QueueProvider for NamedProvider {
        fn name(&self) -> &str {
            self.0
        }

        fn job_queue(&self) -> Arc<dyn JobQueue> {
            unimplemented!("not used by registry tests")
        }

        fn monitoring(&self) -> Arc<dyn QueueMonitoring> {
            unimplemented!("not used by registry tests")
        }
    }

    fn registry() -> QueueProviderRegistry {
        let mut registry = QueueProviderRegistry::new(Arc::new(NamedProvider("documents")));
        registry
            .register(Arc::new(NamedProvider("broker")), &["critical", "emails"])
            .unwrap();
        registry
    }

    #[test]
    fn test_unregistered_queues_use_default_provider() {
        let registry = registry();
        let provider = registry.resolve_single(&["default", "low"]).unwrap();
        assert_eq!(provider.name(), "documents");
    }

    #[test]
    fn test_registered_queues_resolve_to_their_provider() {
        let registry = registry();
        let provider = registry.resolve_single(&["critical", "emails"]).unwrap();
        assert_eq!(provider.name(), "broker");
    }

    #[test]
    fn test_mixed_providers_are_ambiguous() {
        let registry = registry();
        let result = registry.resolve_single(&["default", "critical"]);
        match result {
            Err(SchedulerError::AmbiguousQueueProvider { queues }) => {
                assert_eq!(queues, vec!["default".to_string(), "critical".to_string()]);
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("expected AmbiguousQueueProvider"),
        }
    }

    #[test]
    fn test_empty_queue_list_is_invalid() {
        let registry = registry();
        let empty: [&str; 0] = [];
        assert!(matches!(
            registry.resolve_single(&empty),
            Err(SchedulerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_queue_cannot_move_between_providers() {
        let mut registry = registry();
        let result = registry.register(Arc::new(NamedProvider("other")), &["critical"]);
        assert!(matches!(result, Err(SchedulerError::Configuration(_))));
        assert_eq!(registry.providers().len(), 2);
    }
}
