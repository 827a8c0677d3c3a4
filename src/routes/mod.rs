pub mod ai;
pub mod governance;
