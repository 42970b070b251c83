//! Compiled, immutable permission policy.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::core::config::{
    ConfigError, ConsumerConfig, ConsumerPolicyKind, GatewayConfig, ToolGroup, ToolSelector,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleKind {
    Allow,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceRule {
    AllowAll,
    BlockAll,
    Allow(HashSet<String>),
    Block(HashSet<String>),
}

impl ServiceRule {
    fn from_selector(
        kind: RuleKind,
        group: &str,
        service: &str,
        selector: &ToolSelector,
    ) -> Result<Self, ConfigError> {
        match (kind, selector) {
            (RuleKind::Allow, ToolSelector::Pattern(pattern)) if pattern == "*" => {
                Ok(ServiceRule::AllowAll)
            }
            (RuleKind::Block, ToolSelector::Pattern(pattern)) if pattern == "*" => {
                Ok(ServiceRule::BlockAll)
            }
            (_, ToolSelector::Pattern(pattern)) => Err(ConfigError::InvalidToolSelector {
                group: group.to_string(),
                service: service.to_string(),
                value: pattern.clone(),
            }),
            (RuleKind::Allow, ToolSelector::Tools(tools)) => {
                Ok(ServiceRule::Allow(tools.iter().cloned().collect()))
            }
            (RuleKind::Block, ToolSelector::Tools(tools)) => {
                Ok(ServiceRule::Block(tools.iter().cloned().collect()))
            }
        }
    }

    /// Combines two rules for the same service.
    ///
    /// `AllowAll` dominates everything, then `BlockAll`; only partial sets are
    /// unioned.
    pub fn merge(self, other: ServiceRule) -> ServiceRule {
        match (self, other) {
            (ServiceRule::AllowAll, _) | (_, ServiceRule::AllowAll) => ServiceRule::AllowAll,
            (ServiceRule::BlockAll, _) | (_, ServiceRule::BlockAll) => ServiceRule::BlockAll,
            (ServiceRule::Allow(mut existing), ServiceRule::Allow(incoming)) => {
                existing.extend(incoming);
                ServiceRule::Allow(existing)
            }
            (ServiceRule::Allow(mut existing), ServiceRule::Block(incoming))
            | (ServiceRule::Block(mut existing), ServiceRule::Allow(incoming))
            | (ServiceRule::Block(mut existing), ServiceRule::Block(incoming)) => {
                existing.extend(incoming);
                ServiceRule::Block(existing)
            }
        }
    }

    pub fn permits(&self, tool: &str) -> bool {
        match self {
            ServiceRule::AllowAll => true,
            ServiceRule::BlockAll => false,
            ServiceRule::Allow(tools) => tools.contains(tool),
            ServiceRule::Block(tools) => !tools.contains(tool),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerPolicy {
    pub default_effect: Effect,
    pub per_service: HashMap<String, ServiceRule>,
}

impl ConsumerPolicy {
    pub fn permits(&self, service: &str, tool: &str) -> bool {
        match self.per_service.get(service) {
            Some(rule) => rule.permits(tool),
            None => self.default_effect == Effect::Allow,
        }
    }

    fn compile(
        config: &ConsumerConfig,
        groups: &HashMap<&str, &BTreeMap<String, ToolSelector>>,
    ) -> Result<Self, ConfigError> {
        let (kind, group_names, default_effect) = match (&config.allow, &config.block) {
            (None, Some(block)) => (RuleKind::Block, block.as_slice(), Effect::Allow),
            (Some(allow), None) => (RuleKind::Allow, allow.as_slice(), Effect::Block),
            (allow, block) => match config.kind {
                Some(ConsumerPolicyKind::DefaultAllow) => (
                    RuleKind::Block,
                    block.as_deref().unwrap_or_default(),
                    Effect::Allow,
                ),
                _ => (
                    RuleKind::Allow,
                    allow.as_deref().unwrap_or_default(),
                    Effect::Block,
                ),
            },
        };

        let mut per_service: HashMap<String, ServiceRule> = HashMap::new();
        for group_name in group_names {
            let services = groups
                .get(group_name.as_str())
                .ok_or_else(|| ConfigError::UnknownToolGroup {
                    group: group_name.clone(),
                })?;
            for (service, selector) in services.iter() {
                let rule = ServiceRule::from_selector(kind, group_name, service, selector)?;
                let merged = match per_service.remove(service) {
                    Some(existing) => existing.merge(rule),
                    None => rule,
                };
                per_service.insert(service.clone(), merged);
            }
        }

        Ok(Self {
            default_effect,
            per_service,
        })
    }
}

/// Every consumer's policy plus the default, compiled from one config version.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub version: u64,
    pub default: ConsumerPolicy,
    pub consumers: HashMap<String, ConsumerPolicy>,
}

impl CompiledPolicy {
    pub fn compile(version: u64, config: &GatewayConfig) -> Result<Self, ConfigError> {
        let groups: HashMap<&str, &BTreeMap<String, ToolSelector>> = config
            .tool_groups
            .iter()
            .map(|ToolGroup { name, services }| (name.as_str(), services))
            .collect();

        let default = ConsumerPolicy::compile(&config.permissions.default, &groups)?;
        let consumers = config
            .permissions
            .consumers
            .iter()
            .map(|(tag, consumer)| {
                ConsumerPolicy::compile(consumer, &groups).map(|policy| (tag.clone(), policy))
            })
            .collect::<Result<HashMap<_, _>, _>>()?;

        Ok(Self {
            version,
            default,
            consumers,
        })
    }

    /// Unknown or absent consumer tags resolve to the default policy.
    pub fn policy_for(&self, consumer: Option<&str>) -> &ConsumerPolicy {
        consumer
            .and_then(|tag| self.consumers.get(tag))
            .unwrap_or(&self.default)
    }

    pub fn permits(&self, consumer: Option<&str>, service: &str, tool: &str) -> bool {
        self.policy_for(consumer).permits(service, tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn set(tools: &[&str]) -> HashSet<String> {
        tools.iter().map(|tool| tool.to_string()).collect()
    }

    #[rstest]
    #[case(ServiceRule::AllowAll, ServiceRule::Allow(set(&["a"])))]
    #[case(ServiceRule::Allow(set(&["a"])), ServiceRule::AllowAll)]
    #[case(ServiceRule::AllowAll, ServiceRule::BlockAll)]
    #[case(ServiceRule::BlockAll, ServiceRule::AllowAll)]
    #[case(ServiceRule::AllowAll, ServiceRule::Block(set(&["a"])))]
    fn allow_all_dominates_any_merge(#[case] left: ServiceRule, #[case] right: ServiceRule) {
        assert_eq!(left.merge(right), ServiceRule::AllowAll);
    }

    #[rstest]
    #[case(ServiceRule::BlockAll, ServiceRule::Block(set(&["a"])))]
    #[case(ServiceRule::Block(set(&["a"])), ServiceRule::BlockAll)]
    #[case(ServiceRule::BlockAll, ServiceRule::Allow(set(&["a"])))]
    fn block_all_dominates_partial_sets(#[case] left: ServiceRule, #[case] right: ServiceRule) {
        assert_eq!(left.merge(right), ServiceRule::BlockAll);
    }

    #[test]
    fn partial_sets_of_same_kind_union() {
        let merged = ServiceRule::Allow(set(&["a", "b"])).merge(ServiceRule::Allow(set(&["c"])));
        assert_eq!(merged, ServiceRule::Allow(set(&["a", "b", "c"])));

        let merged = ServiceRule::Block(set(&["a"])).merge(ServiceRule::Block(set(&["a", "d"])));
        assert_eq!(merged, ServiceRule::Block(set(&["a", "d"])));
    }

    #[test]
    fn rule_evaluation() {
        assert!(ServiceRule::AllowAll.permits("x"));
        assert!(!ServiceRule::BlockAll.permits("x"));
        assert!(ServiceRule::Allow(set(&["x"])).permits("x"));
        assert!(!ServiceRule::Allow(set(&["x"])).permits("y"));
        assert!(!ServiceRule::Block(set(&["x"])).permits("x"));
        assert!(ServiceRule::Block(set(&["x"])).permits("y"));
    }

    #[test]
    fn wildcard_must_be_a_star() {
        let err = ServiceRule::from_selector(
            RuleKind::Allow,
            "writers",
            "slack",
            &ToolSelector::Pattern("post*".to_string()),
        )
        .expect_err("only \"*\" is a valid pattern");
        assert!(matches!(err, ConfigError::InvalidToolSelector { .. }));
    }
}
