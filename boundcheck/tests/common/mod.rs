//! Common test utilities and macros

use boundcheck::trace::{self, Replayer};
use boundcheck::{BoundChecker, Config, Violation};
use std::path::Path;

#[derive(Debug)]
pub enum TestResult {
    Success,
    SuccessWithOutput(String),
    Error(String),
    ErrorRegex(String),
}

impl PartialEq for TestResult {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TestResult::Success, TestResult::Success) => true,
            (TestResult::SuccessWithOutput(a), TestResult::SuccessWithOutput(b)) => a == b,
            (TestResult::Error(a), TestResult::Error(b)) => a == b,
            (TestResult::ErrorRegex(pattern), TestResult::Error(msg)) => {
                regex::Regex::new(pattern).unwrap().is_match(msg)
            }
            (TestResult::Error(msg), TestResult::ErrorRegex(pattern)) => {
                regex::Regex::new(pattern).unwrap().is_match(msg)
            }
            _ => false,
        }
    }
}

/// Replays `input_file` against a fresh checker.
///
/// Violations are rendered the way the binary reports them
/// (`bounds check: ...`); any other failure is rendered with its line context.
pub fn run_trace_test(input_file: &Path, config: Config) -> TestResult {
    let source = match std::fs::read_to_string(input_file) {
        Ok(source) => source,
        Err(e) => return TestResult::Error(format!("Cannot read {}: {e}", input_file.display())),
    };
    let checker = match BoundChecker::new(config) {
        Ok(checker) => checker,
        Err(e) => return TestResult::Error(format!("Invalid configuration: {e:#}")),
    };

    let mut replayer = Replayer::new(checker);
    let mut output = Vec::new();
    let result = trace::parse(&source).and_then(|lines| replayer.run(&lines, &mut output));

    match result {
        Ok(()) if output.is_empty() => TestResult::Success,
        Ok(()) => TestResult::SuccessWithOutput(String::from_utf8_lossy(&output).into_owned()),
        Err(e) => match e.downcast_ref::<Violation>() {
            Some(violation) => TestResult::Error(format!("bounds check: {violation}")),
            None => TestResult::Error(format!("{e:#}")),
        },
    }
}

#[macro_export]
macro_rules! check_trace {
    ($test_name:ident, input=$input_file:expr, result=$expected:expr) => {
        check_trace!(
            $test_name,
            input = $input_file,
            config = boundcheck::Config::default(),
            result = $expected
        );
    };
    ($test_name:ident, input=$input_file:expr, config=$config:expr, result=$expected:expr) => {
        #[test]
        fn $test_name() {
            let input_path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
                .join("tests")
                .join("inputs")
                .join($input_file);

            let result = crate::common::run_trace_test(&input_path, $config);
            assert_eq!(result, $expected);
        }
    };
}
