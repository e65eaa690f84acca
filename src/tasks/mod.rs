pub mod charge_task;
