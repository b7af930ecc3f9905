use std::hash::Hasher;

use anyhow::Result;
use siphasher::sip::SipHasher13;

use crate::keys::KeyProjection;
use crate::row::Row;
use crate::store::PartitionId;

/// Routes rows to partitions by a stable hash of their partition fields.
#[derive(Debug, Clone)]
pub struct Partitioner {
    num_partitions: PartitionId,
    projection: Option<KeyProjection>,
}

impl Partitioner {
    /// Everything goes to partition 0
    pub fn single() -> Self {
        Self {
            num_partitions: 1,
            projection: None,
        }
    }

    pub fn hashed(num_partitions: PartitionId, projection: KeyProjection) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
            projection: Some(projection),
        }
    }

    pub fn num_partitions(&self) -> PartitionId {
        self.num_partitions
    }

    pub fn partition_of(&self, row: &Row) -> Result<PartitionId> {
        let Some(projection) = &self.projection else {
            return Ok(0);
        };
        if self.num_partitions == 1 {
            return Ok(0);
        }
        let mut hasher = SipHasher13::new();
        hasher.write(&projection.encode(row)?);
        let hash = hasher.finish();

        Ok((hash % u64::from(self.num_partitions)) as PartitionId)
    }

    /// Split rows by partition, preserving their relative order.
    pub fn split(&self, rows: Vec<Row>) -> Result<Vec<Vec<Row>>> {
        let mut partitions = (0..self.num_partitions).map(|_| Vec::new()).collect::<Vec<_>>();
        for row in rows {
            let partition = self.partition_of(&row)? as usize;
            partitions[partition].push(row);
        }
        Ok(partitions)
    }
}
