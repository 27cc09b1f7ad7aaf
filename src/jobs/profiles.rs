use crate::jobs::model::JobType;
use serde::Serialize;
use std::collections::HashMap;

/// Advisory resources a distributed backend should reserve for a job
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceProfile {
    pub num_cpus: f64,
    /// Bytes
    pub memory: u64,
    pub description: &'static str,
}

impl ResourceProfile {
    /// CPU share in thousandths of a core
    pub fn cpu_millis(&self) -> u32 {
        (self.num_cpus * 1000.0).round().max(0.0) as u32
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory / 1_000_000
    }
}

/// Used for any job type missing from the table
pub const DEFAULT_PROFILE: ResourceProfile = ResourceProfile {
    num_cpus: 1.0,
    memory: 1_000_000_000,
    description: "Default allocation",
};

lazy_static::lazy_static! {
    static ref RESOURCE_PROFILES: HashMap<JobType, ResourceProfile> = {
        let mut table = HashMap::new();
        table.insert(JobType::VideoGeneration, ResourceProfile {
            num_cpus: 2.0,
            memory: 4_000_000_000,
            description: "Heavy video generation tasks",
        });
        table.insert(JobType::ImageGeneration, ResourceProfile {
            num_cpus: 1.0,
            memory: 2_000_000_000,
            description: "Image generation tasks",
        });
        table.insert(JobType::TextGeneration, ResourceProfile {
            num_cpus: 0.5,
            memory: 512_000_000,
            description: "Text/LLM generation tasks",
        });
        table.insert(JobType::CampaignGeneration, ResourceProfile {
            num_cpus: 1.0,
            memory: 1_000_000_000,
            description: "Campaign/spreadsheet generation",
        });
        table.insert(JobType::ProductCreation, ResourceProfile {
            num_cpus: 1.0,
            memory: 1_500_000_000,
            description: "Product design creation",
        });
        table.insert(JobType::BlogGeneration, ResourceProfile {
            num_cpus: 0.5,
            memory: 512_000_000,
            description: "Blog content generation",
        });
        table.insert(JobType::BatchOperation, ResourceProfile {
            num_cpus: 0.5,
            memory: 256_000_000,
            description: "Lightweight batch operations",
        });
        table.insert(JobType::WorkflowExecution, ResourceProfile {
            num_cpus: 1.0,
            memory: 1_000_000_000,
            description: "Workflow execution tasks",
        });
        table
    };
}

pub fn profile_for(job_type: JobType) -> ResourceProfile {
    RESOURCE_PROFILES
        .get(&job_type)
        .copied()
        .unwrap_or(DEFAULT_PROFILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_table() {
        let video = profile_for(JobType::VideoGeneration);
        assert_eq!(video.cpu_millis(), 2000);
        assert_eq!(video.memory_mb(), 4000);

        let text = profile_for(JobType::TextGeneration);
        assert_eq!(text.cpu_millis(), 500);
        assert_eq!(text.memory, 512_000_000);

        assert_eq!(profile_for(JobType::BatchOperation).memory_mb(), 256);
    }
}
