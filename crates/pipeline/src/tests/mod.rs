mod helpers;
mod stage_tests;
mod strategy_tests;
