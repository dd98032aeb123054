// The included makefile is built by one of our own rules, which forces a
// full reparse; the restarted run sees the generated variable.
crate::system_test_cases!({
    args: &["--no-print-directory"],
    expected_status: 0,
    expected_stdout: "",
    expected_stderr: "make: INFO  | make[0]: Restarting makefile parsing\n",
    expected_files: &[("gen.mk", "VAL = from-gen\n"), ("out", "from-gen\n")],
});
