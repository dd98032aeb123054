crate::system_test_cases!({
    args: &["--no-print-directory"],
    expected_status: 0,
    expected_stdout: "Makefile:2:5 $ echo hello\nhello\n",
    expected_stderr: "",
    expected_files: &[],
});
