//! Node, job, partition and credential model.

pub mod cred;
pub mod job;
pub mod node;
pub mod partition;
pub mod resources;

pub use cred::{
    evaluate_for_partition, Acl, AclEntry, Class, CredKind, CredStore, Credential,
    CredentialView, JobCredentials, Qos, QosFlags,
};
pub use job::{
    ArrayMembership, CompletedJob, DistributionPolicy, HoldKind, HoldReason, Holds, Job,
    JobError, JobFlags, JobMessage, JobResult, JobState, JobTable, JobTrigger, MalleableShape,
    MessageBuffer, NodeAlloc, Req, TaskMap,
};
pub use node::{Availability, AvailabilityPolicy, Filesystem, Node, NodeState, NodeTable};
pub use partition::{NodeAllocPolicy, Partition, PartitionMask, PartitionTable};
pub use resources::{task_count_within, RejectReason, ResourceDim, Resources, WHOLE};
