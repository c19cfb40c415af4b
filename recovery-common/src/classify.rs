//! Log-text classification into [`ErrorKind`]s.
//!
//! Rules are evaluated strictly in declaration order and the first rule
//! with a matching pattern decides the kind. Overlapping patterns are
//! therefore resolved by position in the table, never by match length or
//! specificity. Text that matches no rule is [`ErrorKind::Unknown`].

use crate::errors::ConfigError;
use crate::types::ErrorKind;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Built-in rule table: (kind, case-insensitive regex patterns).
const DEFAULT_RULES: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::CudaOutOfMemory,
        &[
            r"CUDA out of memory",
            r"torch\.(cuda\.)?OutOfMemoryError",
            r"CUBLAS_STATUS_ALLOC_FAILED",
            r"No available memory for the cache blocks",
        ],
    ),
    (
        ErrorKind::ModelLoadingFailed,
        &[
            r"failed to load model",
            r"error (loading|while loading) (the )?model",
            r"model weights? .*not found",
            r"safetensors_rust\.SafetensorError",
            r"(HFValidationError|RepositoryNotFoundError)",
        ],
    ),
    (
        ErrorKind::GpuCommunicationError,
        &[
            r"NCCL (error|WARN|timeout)",
            r"(Work|ProcessGroup)NCCL",
            r"collective operation timeout",
            r"ncclSystemError|ncclInternalError|ncclUnhandledCudaError",
            r"GPU has fallen off the bus",
            r"\bXid\b",
            r"CUDA error: an illegal memory access",
            r"unhandled cuda error",
        ],
    ),
    (
        ErrorKind::ApiTimeout,
        &[
            r"request timed out",
            r"\btimeout(Error)?\b",
            r"deadline exceeded",
            r"504 Gateway Time-?out",
        ],
    ),
    (
        ErrorKind::ServiceCrash,
        &[
            r"Segmentation fault",
            r"core dumped",
            r"Main process exited",
            r"EngineDeadError",
            r"Engine (core )?process failed",
            r"Failed with result '(signal|core-dump|exit-code)'",
        ],
    ),
    (
        ErrorKind::DiskFull,
        &[
            r"No space left on device",
            r"\bENOSPC\b",
            r"Disk quota exceeded",
            r"disk (is )?full",
        ],
    ),
    (
        ErrorKind::MemoryExhausted,
        &[
            r"Cannot allocate memory",
            r"\bMemoryError\b",
            r"Out of memory: Killed process",
            r"oom-kill",
            r"\bENOMEM\b",
        ],
    ),
    (
        ErrorKind::ConfigError,
        &[
            r"unrecognized arguments",
            r"invalid (config|configuration|argument)",
            r"\bValueError\b",
            r"configuration error",
            r"max_model_len .*(greater|larger) than",
        ],
    ),
    (
        ErrorKind::PermissionError,
        &[r"Permission denied", r"\bEACCES\b", r"Operation not permitted"],
    ),
    (
        ErrorKind::NetworkError,
        &[
            r"Connection refused",
            r"Network is unreachable",
            r"Name or service not known",
            r"Temporary failure in name resolution",
            r"Connection reset by peer",
            r"Address already in use",
        ],
    ),
];

/// Serializable rule definition used by configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub kind: ErrorKind,
    pub patterns: Vec<String>,
}

/// A compiled classification rule.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    kind: ErrorKind,
    patterns: Vec<String>,
    matcher: Regex,
}

impl ClassificationRule {
    /// Compile a rule. All patterns are matched case-insensitively.
    pub fn new<S: AsRef<str>>(kind: ErrorKind, patterns: &[S]) -> Result<Self, ConfigError> {
        if kind == ErrorKind::Unknown {
            return Err(ConfigError::InvalidRule {
                kind,
                reason: "unknown is the catch-all and cannot have patterns".to_string(),
            });
        }
        if patterns.is_empty() {
            return Err(ConfigError::InvalidRule {
                kind,
                reason: "rule has no patterns".to_string(),
            });
        }

        let patterns: Vec<String> = patterns.iter().map(|p| p.as_ref().to_string()).collect();
        for pattern in &patterns {
            if let Err(e) = Regex::new(pattern) {
                return Err(ConfigError::InvalidPattern {
                    kind,
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let alternation = patterns
            .iter()
            .map(|p| format!("(?:{p})"))
            .collect::<Vec<_>>()
            .join("|");
        let matcher = RegexBuilder::new(&alternation)
            .case_insensitive(true)
            .build()
            .map_err(|e| ConfigError::InvalidPattern {
                kind,
                pattern: alternation.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            kind,
            patterns,
            matcher,
        })
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn matches(&self, text: &str) -> bool {
        self.matcher.is_match(text)
    }
}

/// Ordered, immutable rule table.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<ClassificationRule>,
}

impl Classifier {
    /// Build a classifier from an ordered list of compiled rules.
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    /// The built-in rule table.
    pub fn builtin() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .filter_map(|(kind, patterns)| match ClassificationRule::new(*kind, *patterns) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    tracing::error!("Skipping built-in rule for {}: {}", kind, e);
                    None
                }
            })
            .collect();
        Self { rules }
    }

    /// Build from configuration. An empty list selects the built-in table.
    pub fn from_specs(specs: &[RuleSpec]) -> Result<Self, ConfigError> {
        if specs.is_empty() {
            return Ok(Self::builtin());
        }
        let rules = specs
            .iter()
            .map(|spec| ClassificationRule::new(spec.kind, spec.patterns.as_slice()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Map log text to exactly one kind. First matching rule wins.
    pub fn classify(&self, text: &str) -> ErrorKind {
        self.rules
            .iter()
            .find(|rule| rule.matches(text))
            .map(ClassificationRule::kind)
            .unwrap_or(ErrorKind::Unknown)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Representative log lines per kind, used by the self-test command and tests.
pub const SAMPLE_LOGS: &[(ErrorKind, &str)] = &[
    (
        ErrorKind::CudaOutOfMemory,
        "torch.OutOfMemoryError: CUDA out of memory. Tried to allocate 2.00 GiB",
    ),
    (
        ErrorKind::ModelLoadingFailed,
        "RuntimeError: Failed to load model weights from /models/qwen3",
    ),
    (
        ErrorKind::GpuCommunicationError,
        "NCCL error in: ../csrc/distributed/c10d/ProcessGroupNCCL.cpp:1970",
    ),
    (ErrorKind::ApiTimeout, "ERROR api_server: request timed out after 60s"),
    (
        ErrorKind::ServiceCrash,
        "vllm.service: Main process exited, code=killed, status=11/SEGV",
    ),
    (ErrorKind::DiskFull, "OSError: [Errno 28] No space left on device"),
    (
        ErrorKind::MemoryExhausted,
        "kernel: Out of memory: Killed process 4242 (python3)",
    ),
    (
        ErrorKind::ConfigError,
        "api_server.py: error: unrecognized arguments: --gpu-memory-utilisation",
    ),
    (
        ErrorKind::PermissionError,
        "PermissionError: [Errno 13] Permission denied: '/var/log/vllm/server.log'",
    ),
    (
        ErrorKind::NetworkError,
        "OSError: [Errno 98] Address already in use",
    ),
    (ErrorKind::Unknown, "INFO: Started server process [1234]"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn cuda_oom_scenario() {
        let classifier = Classifier::builtin();
        assert_eq!(
            classifier.classify("CUDA out of memory error occurred"),
            ErrorKind::CudaOutOfMemory
        );
    }

    #[test]
    fn builtin_table_compiles_every_rule() {
        let classifier = Classifier::builtin();
        assert_eq!(classifier.rules().len(), DEFAULT_RULES.len());
        let kinds: Vec<_> = classifier.rules().iter().map(|r| r.kind()).collect();
        assert_eq!(kinds, ErrorKind::ALL[..ErrorKind::ALL.len() - 1].to_vec());
    }

    #[test]
    fn samples_classify_to_their_kind() {
        let classifier = Classifier::builtin();
        for (expected, line) in SAMPLE_LOGS {
            assert_eq!(classifier.classify(line), *expected, "line: {line}");
        }
    }

    #[test]
    fn nccl_timeouts_are_gpu_communication_errors() {
        let classifier = Classifier::builtin();
        for line in [
            "NCCL timeout in ProcessGroupNCCL",
            "[Rank 1] Watchdog caught collective operation timeout: WorkNCCL(SeqNum=42, OpType=ALLREDUCE, Timeout(ms)=600000) ran for 600012 milliseconds before timing out.",
        ] {
            assert_eq!(
                classifier.classify(line),
                ErrorKind::GpuCommunicationError,
                "line: {line}"
            );
        }
        assert_eq!(
            classifier.classify("httpx.ReadTimeout: timeout while waiting for response"),
            ErrorKind::ApiTimeout
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        let classifier = Classifier::builtin();
        assert_eq!(
            classifier.classify("no SPACE left ON device"),
            ErrorKind::DiskFull
        );
    }

    #[test]
    fn empty_text_is_unknown() {
        assert_eq!(Classifier::builtin().classify(""), ErrorKind::Unknown);
    }

    #[test]
    fn earlier_rule_wins_on_overlap() {
        // Text matching both the OOM and the disk rule.
        let text = "CUDA out of memory; also No space left on device";
        assert_eq!(Classifier::builtin().classify(text), ErrorKind::CudaOutOfMemory);

        // Reversing declaration order reverses the decision.
        let reversed = Classifier::new(vec![
            ClassificationRule::new(ErrorKind::DiskFull, &["No space left"]).unwrap(),
            ClassificationRule::new(ErrorKind::CudaOutOfMemory, &["CUDA out of memory"]).unwrap(),
        ]);
        assert_eq!(reversed.classify(text), ErrorKind::DiskFull);
    }

    #[test]
    fn order_beats_specificity() {
        let classifier = Classifier::new(vec![
            ClassificationRule::new(ErrorKind::ApiTimeout, &["error"]).unwrap(),
            ClassificationRule::new(ErrorKind::GpuCommunicationError, &["NCCL error in ProcessGroup"])
                .unwrap(),
        ]);
        assert_eq!(
            classifier.classify("NCCL error in ProcessGroup"),
            ErrorKind::ApiTimeout
        );
    }

    #[test]
    fn unknown_rule_is_rejected() {
        let err = ClassificationRule::new(ErrorKind::Unknown, &["anything"]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRule { .. }));
    }

    #[test]
    fn empty_rule_is_rejected() {
        let empty: [&str; 0] = [];
        let err = ClassificationRule::new(ErrorKind::DiskFull, &empty[..]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRule { .. }));
    }

    #[test]
    fn invalid_pattern_is_reported_with_kind() {
        let err = ClassificationRule::new(ErrorKind::DiskFull, &["(unclosed"]).unwrap_err();
        match err {
            ConfigError::InvalidPattern { kind, pattern, .. } => {
                assert_eq!(kind, ErrorKind::DiskFull);
                assert_eq!(pattern, "(unclosed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn from_specs_empty_uses_builtin() {
        let classifier = Classifier::from_specs(&[]).unwrap();
        assert_eq!(classifier.rules().len(), DEFAULT_RULES.len());
    }

    #[test]
    fn from_specs_preserves_order() {
        let specs = vec![
            RuleSpec {
                kind: ErrorKind::NetworkError,
                patterns: vec!["refused".to_string()],
            },
            RuleSpec {
                kind: ErrorKind::ServiceCrash,
                patterns: vec!["refused".to_string(), "segfault".to_string()],
            },
        ];
        let classifier = Classifier::from_specs(&specs).unwrap();
        assert_eq!(classifier.classify("connection refused"), ErrorKind::NetworkError);
        assert_eq!(classifier.classify("segfault at 0x0"), ErrorKind::ServiceCrash);
        assert_eq!(classifier.classify("CUDA out of memory"), ErrorKind::Unknown);
    }

    proptest! {
        #[test]
        fn classify_is_deterministic(text in ".{0,400}") {
            let classifier = Classifier::builtin();
            let first = classifier.classify(&text);
            prop_assert_eq!(first, classifier.classify(&text));
            prop_assert!(ErrorKind::ALL.contains(&first));
        }

        #[test]
        fn oom_marker_wins_regardless_of_surrounding_text(prefix in "[a-z ]{0,40}", suffix in "[a-z ]{0,40}") {
            let text = format!("{prefix} CUDA out of memory {suffix}");
            prop_assert_eq!(Classifier::builtin().classify(&text), ErrorKind::CudaOutOfMemory);
        }
    }
}
