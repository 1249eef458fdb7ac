pub mod activity;
pub mod artifact;
pub mod run;
pub mod work_item;

#[cfg(test)]
pub(crate) mod test_utils;
