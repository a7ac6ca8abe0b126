mod record;

pub use record::{
    init_graph, list_checkpoints, restore_weights, save_run_config, warn_existing_checkpoints,
    CheckpointData, CheckpointIndex, Checkpointer,
};
