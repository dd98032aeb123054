crate::system_test_cases!(
    {
        args: &["--no-print-directory"],
        expected_status: 0,
        expected_stdout: "",
        expected_stderr: "",
        expected_files: &[("test", "prereq\n"), ("test_prereq", "prereq\n")],
    },
    {
        args: &["--no-print-directory", "test_prereq"],
        expected_status: 0,
        expected_stdout: "",
        expected_stderr: "",
        expected_files: &[("test_prereq", "prereq\n")],
    },
);
