//! Static registry of supported architectures.
//!
//! Each architecture identifier maps to an initialization family, and each
//! family to an ordered list of layer classification rules. Rules are
//! validated when the list is built, so lookups never fall back to ad hoc
//! name checks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dataset::DatasetSpec;
use crate::error::{PolError, Result};
use crate::init_check::InitRule;
use crate::network::{Mlp, Network};

pub const MLP_HIDDEN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Architecture {
    Resnet20,
    Resnet32,
    Resnet44,
    Resnet56,
    Resnet110,
    Resnet1202,
    Resnet18,
    Resnet34,
    Resnet50,
    Resnet101,
    Resnet152,
    Mlp,
}

impl Architecture {
    pub const ALL: [Architecture; 12] = [
        Architecture::Resnet20,
        Architecture::Resnet32,
        Architecture::Resnet44,
        Architecture::Resnet56,
        Architecture::Resnet110,
        Architecture::Resnet1202,
        Architecture::Resnet18,
        Architecture::Resnet34,
        Architecture::Resnet50,
        Architecture::Resnet101,
        Architecture::Resnet152,
        Architecture::Mlp,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Architecture::Resnet20 => "resnet20",
            Architecture::Resnet32 => "resnet32",
            Architecture::Resnet44 => "resnet44",
            Architecture::Resnet56 => "resnet56",
            Architecture::Resnet110 => "resnet110",
            Architecture::Resnet1202 => "resnet1202",
            Architecture::Resnet18 => "resnet18",
            Architecture::Resnet34 => "resnet34",
            Architecture::Resnet50 => "resnet50",
            Architecture::Resnet101 => "resnet101",
            Architecture::Resnet152 => "resnet152",
            Architecture::Mlp => "mlp",
        }
    }

    pub fn family(self) -> InitFamily {
        match self {
            Architecture::Resnet20
            | Architecture::Resnet32
            | Architecture::Resnet44
            | Architecture::Resnet56
            | Architecture::Resnet110
            | Architecture::Resnet1202 => InitFamily::ResnetCifar,
            Architecture::Resnet50 => InitFamily::ResnetCifar100,
            Architecture::Resnet18
            | Architecture::Resnet34
            | Architecture::Resnet101
            | Architecture::Resnet152 => InitFamily::Resnet,
            Architecture::Mlp => InitFamily::Default,
        }
    }

    /// Build the trainable network for this architecture.
    ///
    /// Only architectures with a built-in implementation can be replayed;
    /// the residual networks are supplied by an external backend.
    pub fn network(self, data: &DatasetSpec) -> Result<Box<dyn Network>> {
        match self {
            Architecture::Mlp => Ok(Box::new(Mlp::new(data.input_dim(), MLP_HIDDEN, data.classes))),
            other => Err(PolError::InvalidConfig(format!(
                "architecture {other} has no built-in network; only initialization checks are available"
            ))),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = PolError;

    fn from_str(s: &str) -> Result<Self> {
        Architecture::ALL
            .iter()
            .copied()
            .find(|a| a.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PolError::UnknownArchitecture(s.to_string()))
    }
}

impl TryFrom<String> for Architecture {
    type Error = PolError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Architecture> for String {
    fn from(a: Architecture) -> Self {
        a.name().to_string()
    }
}

/// Which classification ruleset an architecture's parameters follow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitFamily {
    /// Residual networks for CIFAR-10 (resnet20 ... resnet1202).
    ResnetCifar,
    /// The 50-layer residual network trained on CIFAR-100.
    ResnetCifar100,
    /// Generic residual networks.
    Resnet,
    /// Everything else: fully-connected, linear and convolution tensors.
    Default,
}

/// Name/shape pattern a parameter must match for a rule to apply.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamPattern {
    /// Substrings that must all occur in the name.
    pub all_of: Vec<&'static str>,
    /// At least one of these must occur (ignored when empty).
    pub any_of: Vec<&'static str>,
    /// Required tensor rank.
    pub rank: Option<usize>,
}

impl ParamPattern {
    fn named(all_of: &[&'static str], any_of: &[&'static str]) -> Self {
        Self { all_of: all_of.to_vec(), any_of: any_of.to_vec(), rank: None }
    }

    fn rank(rank: usize) -> Self {
        Self { all_of: Vec::new(), any_of: Vec::new(), rank: Some(rank) }
    }

    pub fn matches(&self, name: &str, shape: &[usize]) -> bool {
        self.all_of.iter().all(|s| name.contains(s))
            && (self.any_of.is_empty() || self.any_of.iter().any(|s| name.contains(s)))
            && self.rank.map_or(true, |r| shape.len() == r)
    }
}

/// What a matched parameter is tested against.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LayerRole {
    /// A weight tensor tested on its own.
    Weight(InitRule),
    /// A bias tested jointly with the weight of the same layer.
    Bias(InitRule),
}

#[derive(Clone, Debug, PartialEq)]
pub struct LayerRule {
    pub pattern: ParamPattern,
    pub role: LayerRole,
}

/// Ordered classification rules; the first matching rule wins.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerRules {
    rules: Vec<LayerRule>,
}

impl LayerRules {
    pub fn new(rules: Vec<LayerRule>) -> Result<Self> {
        if rules.is_empty() {
            return Err(PolError::InvalidRule("empty rule list".to_string()));
        }
        for rule in &rules {
            let p = &rule.pattern;
            if p.all_of.is_empty() && p.any_of.is_empty() && p.rank.is_none() {
                return Err(PolError::InvalidRule("pattern matches every parameter".to_string()));
            }
            match rule.role {
                // the paired weight is found by swapping "bias" for "weight"
                LayerRole::Bias(_) if !p.all_of.contains(&"bias") => {
                    return Err(PolError::InvalidRule(format!(
                        "bias rule {:?} does not require \"bias\" in the name",
                        p.all_of
                    )));
                }
                LayerRole::Weight(_) if p.all_of.contains(&"bias") => {
                    return Err(PolError::InvalidRule(format!(
                        "weight rule {:?} only matches bias parameters",
                        p.all_of
                    )));
                }
                LayerRole::Bias(r) if r != InitRule::DefaultBias => {
                    return Err(PolError::InvalidRule(format!("{r} is not a bias rule")));
                }
                LayerRole::Weight(InitRule::DefaultBias) => {
                    return Err(PolError::InvalidRule("default_bias used for a weight".to_string()));
                }
                _ => {}
            }
        }
        Ok(Self { rules })
    }

    pub fn for_family(family: InitFamily) -> Result<Self> {
        let linear = ["fc", "linear"];
        let layers = ["fc", "conv", "linear"];
        let bias = LayerRole::Bias(InitRule::DefaultBias);
        let rules = match family {
            InitFamily::Resnet => vec![
                rule(ParamPattern::named(&["weight", "conv"], &[]), LayerRole::Weight(InitRule::Resnet)),
                rule(ParamPattern::named(&["weight", "fc"], &[]), LayerRole::Weight(InitRule::Default)),
                rule(ParamPattern::named(&["bias"], &linear), bias),
            ],
            InitFamily::ResnetCifar100 => vec![
                rule(ParamPattern::rank(4), LayerRole::Weight(InitRule::Default)),
                rule(ParamPattern::named(&["weight", "fc"], &[]), LayerRole::Weight(InitRule::Default)),
                rule(ParamPattern::named(&["bias"], &linear), bias),
            ],
            InitFamily::ResnetCifar => vec![
                rule(ParamPattern::named(&["weight"], &layers), LayerRole::Weight(InitRule::ResnetCifar)),
                rule(ParamPattern::named(&["bias"], &layers), bias),
            ],
            InitFamily::Default => vec![
                rule(ParamPattern::named(&["weight"], &layers), LayerRole::Weight(InitRule::Default)),
                rule(ParamPattern::named(&["bias"], &layers), bias),
            ],
        };
        Self::new(rules)
    }

    pub fn classify(&self, name: &str, shape: &[usize]) -> Option<LayerRole> {
        self.rules
            .iter()
            .find(|r| r.pattern.matches(name, shape))
            .map(|r| r.role)
    }
}

fn rule(pattern: ParamPattern, role: LayerRole) -> LayerRule {
    LayerRule { pattern, role }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_lookup() {
        assert_eq!("resnet20".parse::<Architecture>().unwrap(), Architecture::Resnet20);
        assert_eq!("ResNet50".parse::<Architecture>().unwrap(), Architecture::Resnet50);
        assert!(matches!(
            "vgg16".parse::<Architecture>(),
            Err(PolError::UnknownArchitecture(_))
        ));
    }

    #[test]
    fn test_family_dispatch() {
        assert_eq!(Architecture::Resnet56.family(), InitFamily::ResnetCifar);
        assert_eq!(Architecture::Resnet50.family(), InitFamily::ResnetCifar100);
        assert_eq!(Architecture::Resnet18.family(), InitFamily::Resnet);
        assert_eq!(Architecture::Mlp.family(), InitFamily::Default);
    }

    #[test]
    fn test_builtin_rules_validate() {
        for family in [
            InitFamily::ResnetCifar,
            InitFamily::ResnetCifar100,
            InitFamily::Resnet,
            InitFamily::Default,
        ] {
            assert!(LayerRules::for_family(family).is_ok(), "{family:?}");
        }
    }

    #[test]
    fn test_resnet_classification() {
        let rules = LayerRules::for_family(InitFamily::Resnet).unwrap();
        assert_eq!(
            rules.classify("layer1.0.conv1.weight", &[64, 64, 3, 3]),
            Some(LayerRole::Weight(InitRule::Resnet))
        );
        assert_eq!(rules.classify("fc.weight", &[10, 512]), Some(LayerRole::Weight(InitRule::Default)));
        assert_eq!(rules.classify("fc.bias", &[10]), Some(LayerRole::Bias(InitRule::DefaultBias)));
        assert_eq!(rules.classify("layer1.0.bn1.weight", &[64]), None);
    }

    #[test]
    fn test_cifar100_matches_by_rank() {
        let rules = LayerRules::for_family(InitFamily::ResnetCifar100).unwrap();
        assert_eq!(
            rules.classify("layer2.downsample.0.weight", &[128, 64, 1, 1]),
            Some(LayerRole::Weight(InitRule::Default))
        );
        assert_eq!(rules.classify("bn1.bias", &[64]), None);
    }

    #[test]
    fn test_rejects_bias_rule_without_bias_name() {
        let rules = vec![rule(ParamPattern::named(&["fc"], &[]), LayerRole::Bias(InitRule::DefaultBias))];
        assert!(matches!(LayerRules::new(rules), Err(PolError::InvalidRule(_))));
    }

    #[test]
    fn test_rejects_catch_all_pattern() {
        let rules = vec![rule(ParamPattern::named(&[], &[]), LayerRole::Weight(InitRule::Default))];
        assert!(LayerRules::new(rules).is_err());
    }

    #[test]
    fn test_only_mlp_has_builtin_network() {
        let data = DatasetSpec::synthetic();
        assert!(Architecture::Mlp.network(&data).is_ok());
        assert!(Architecture::Resnet20.network(&data).is_err());
    }
}
