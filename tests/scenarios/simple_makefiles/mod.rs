pub mod t1_hello;
pub mod t2_prereq;
