// A recipe invoking $(MAKE) is forwarded in-process; the sub-make inherits
// --no-print-directory through MAKEFLAGS.
crate::system_test_cases!({
    args: &["--no-print-directory"],
    expected_status: 0,
    expected_stdout: "",
    expected_stderr: "",
    expected_files: &[("inner_out", "inner\n")],
});
