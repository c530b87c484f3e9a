pub mod dag;
pub mod state;
pub mod steps;
