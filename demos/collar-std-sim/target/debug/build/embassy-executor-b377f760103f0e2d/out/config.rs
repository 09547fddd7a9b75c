pub const TASK_ARENA_SIZE: usize = 65536;
