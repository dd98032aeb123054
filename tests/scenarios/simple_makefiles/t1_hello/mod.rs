crate::system_test_cases!({
    args: &["--no-print-directory"],
    expected_status: 0,
    expected_stdout: "",
    expected_stderr: "",
    expected_files: &[("test", "Hello, world!\n")],
});
