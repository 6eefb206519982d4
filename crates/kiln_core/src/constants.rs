pub mod routes {
    pub const HEALTH: &str = "/health";

    pub const MODELS: &str = "/models";

    pub const JOBS: &str = "/jobs";
    pub const JOBS_BY_ID: &str = "/jobs/{id}";
    pub const JOBS_STATUS: &str = "/jobs/{id}/status";
    pub const JOBS_OUTPUT: &str = "/jobs/{id}/output";
    pub const JOBS_LOGS: &str = "/jobs/{id}/logs";
    pub const JOBS_CANCEL: &str = "/jobs/{id}/cancel";
}

pub mod labels {
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const MANAGED_BY_VALUE: &str = "kiln";
    pub const JOB_ID: &str = "kiln.dev/job-id";
    pub const MODEL: &str = "kiln.dev/model";

    /// Selects every execution unit created by this orchestrator.
    pub const MANAGED_SELECTOR: &str = "app.kubernetes.io/managed-by=kiln";
}

/// Placeholder names available to every manifest template.
pub mod placeholders {
    pub const JOB_ID: &str = "JOB_ID";
    pub const POD_NAME: &str = "POD_NAME";
    pub const MODEL_ID: &str = "MODEL_ID";
    pub const IMAGE: &str = "IMAGE";
    pub const MODEL_DIR: &str = "MODEL_DIR";
    pub const ENVIRONMENT: &str = "ENVIRONMENT";
    pub const OUTPUT_DIR: &str = "OUTPUT_DIR";
    pub const OUTPUT_PATH: &str = "OUTPUT_PATH";
    pub const CPU_LIMIT: &str = "CPU_LIMIT";
    pub const MEMORY_LIMIT: &str = "MEMORY_LIMIT";
    pub const GPU_LIMIT: &str = "GPU_LIMIT";
    pub const INPUT_PREFIX: &str = "INPUT_";

    pub const BUILTIN: &[&str] = &[
        JOB_ID,
        POD_NAME,
        MODEL_ID,
        IMAGE,
        MODEL_DIR,
        ENVIRONMENT,
        OUTPUT_DIR,
        OUTPUT_PATH,
        CPU_LIMIT,
        MEMORY_LIMIT,
        GPU_LIMIT,
    ];
}

pub mod defaults {
    pub const CAPACITY: usize = 1;
    pub const ADMISSION_TIMEOUT_SECS: u64 = 300;
    pub const POLL_INTERVAL_SECS: u64 = 5;
    pub const MAX_POLL_FAILURES: u32 = 10;
    pub const MAX_RUNTIME_SECS: u64 = 3600;
    pub const SUBMIT_ATTEMPTS: u32 = 5;
    pub const DELETE_ATTEMPTS: u32 = 5;
    pub const LOG_TAIL_LINES: usize = 100;
    pub const NAMESPACE: &str = "default";
}
