pub mod t1_echo_format;
pub mod t2_submake;
pub mod t3_exit_code;
pub mod t4_restart;
pub mod t5_parallel;
