crate::system_test_cases!({
    args: &["--no-print-directory", "fail"],
    expected_status: 2,
    expected_stdout: "",
    expected_stderr: "Makefile:2:5: command 'false' failed, return code 1\n",
    expected_files: &[],
});
