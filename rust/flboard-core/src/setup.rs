//! The client setup a user confirms before training starts, and the
//! [`TrainingConfiguration`] that is submitted to the training service.
//!
//! The training service simulates the clients itself: the setup only
//! decides how many of them take part and how much data each one
//! holds. The total amount of data is capped at
//! [`TOTAL_DATA_SIZE_CAP`] samples. The service doesn't enforce that
//! cap, so it is checked here, before anything goes over the network.

use derive_more::Display;
use thiserror::Error;

/// The maximal number of simulated clients.
pub const MAX_CLIENTS: usize = 5;
/// The maximal total number of samples over all the clients.
pub const TOTAL_DATA_SIZE_CAP: u64 = 6000;
/// Totals above this number of samples are flagged as high load.
pub const HIGH_LOAD_DATA_SIZE: u64 = 4000;
/// The number of samples a newly added client starts with.
pub const DEFAULT_CLIENT_DATA_SIZE: u64 = 1000;
/// The minimal number of samples of a client.
pub const MIN_CLIENT_DATA_SIZE: u64 = 100;
/// The maximal number of samples of a client.
pub const MAX_CLIENT_DATA_SIZE: u64 = 2000;
/// The granularity of a client's number of samples.
pub const CLIENT_DATA_SIZE_STEP: u64 = 100;
/// The data distribution of the simulated clients.
pub const DEFAULT_DATA_DISTRIBUTION: &str = "normal";

#[derive(Error, Debug, Clone, PartialEq)]
/// A client-side constraint of the training setup is violated.
pub enum ValidationError {
    #[error("Total data size too large. Please reduce the number of samples or clients.")]
    DataSizeCap { total: u64, cap: u64 },
    #[error("Adding more clients would exceed recommended total data size")]
    ClientWouldExceedCap { total: u64, cap: u64 },
    #[error("at most {0} clients are supported")]
    TooManyClients(usize),
    #[error("at least one client is required")]
    NoClients,
    #[error("the last client cannot be removed")]
    LastClient,
    #[error("no client with id {0}")]
    UnknownClient(u32),
    #[error("a client holds between {min} and {max} samples in steps of {step}, got {size}")]
    InvalidDataSize {
        size: u64,
        min: u64,
        max: u64,
        step: u64,
    },
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("{0} must be a positive number")]
    NotPositive(&'static str),
}

/// The training parameters submitted to the training service.
///
/// This is also the exact body of the `initialize` request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfiguration {
    /// The number of simulated clients.
    pub num_clients: u32,
    /// The number of local training epochs per round.
    pub local_epochs: u32,
    /// The local batch size.
    pub batch_size: u32,
    /// The ratio of the noise standard deviation to the clipping norm.
    pub noise_multiplier: f64,
    /// The clipping norm of the client updates.
    pub l2_norm_clip: f64,
}

impl Default for TrainingConfiguration {
    fn default() -> Self {
        Self {
            num_clients: 1,
            local_epochs: 1,
            batch_size: 32,
            noise_multiplier: 1.0,
            l2_norm_clip: 1.0,
        }
    }
}

impl TrainingConfiguration {
    /// Checks the parameter ranges.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.num_clients == 0 {
            return Err(ValidationError::Zero("num_clients"));
        }
        if self.num_clients as usize > MAX_CLIENTS {
            return Err(ValidationError::TooManyClients(MAX_CLIENTS));
        }
        if self.local_epochs == 0 {
            return Err(ValidationError::Zero("local_epochs"));
        }
        if self.batch_size == 0 {
            return Err(ValidationError::Zero("batch_size"));
        }
        // written as negations so that NaN is rejected too
        if !(self.noise_multiplier > 0.0) {
            return Err(ValidationError::NotPositive("noise_multiplier"));
        }
        if !(self.l2_norm_clip > 0.0) {
            return Err(ValidationError::NotPositive("l2_norm_clip"));
        }
        Ok(())
    }
}

/// A simulated client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSpec {
    pub id: u32,
    pub data_size: u64,
    pub data_distribution: String,
}

impl ClientSpec {
    fn new(id: u32, data_size: u64) -> Self {
        Self {
            id,
            data_size,
            data_distribution: DEFAULT_DATA_DISTRIBUTION.to_string(),
        }
    }
}

/// An advisory about the total data size of a setup.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum LoadWarning {
    /// The total is above [`HIGH_LOAD_DATA_SIZE`], which may affect performance.
    #[display(fmt = "High data load ({} samples) may affect performance.", _0)]
    HighLoad(u64),
    /// The total is above [`TOTAL_DATA_SIZE_CAP`]. Such a setup can't be submitted.
    #[display(fmt = "Total data size too large ({} samples).", _0)]
    ExceedsCap(u64),
}

/// The simulated clients a user configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSetup {
    clients: Vec<ClientSpec>,
}

impl Default for ClientSetup {
    fn default() -> Self {
        Self {
            clients: vec![ClientSpec::new(1, DEFAULT_CLIENT_DATA_SIZE)],
        }
    }
}

impl ClientSetup {
    /// Creates a setup with a single client of [`DEFAULT_CLIENT_DATA_SIZE`] samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a setup with one client per given data size.
    ///
    /// The total data size is not checked here: an oversized setup can
    /// exist, it just can't be turned into a configuration.
    pub fn from_data_sizes(sizes: &[u64]) -> Result<Self, ValidationError> {
        if sizes.is_empty() {
            return Err(ValidationError::NoClients);
        }
        if sizes.len() > MAX_CLIENTS {
            return Err(ValidationError::TooManyClients(MAX_CLIENTS));
        }
        let clients = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                check_data_size(size)?;
                Ok(ClientSpec::new(i as u32 + 1, size))
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;
        Ok(Self { clients })
    }

    pub fn clients(&self) -> &[ClientSpec] {
        &self.clients
    }

    pub fn total_data_size(&self) -> u64 {
        self.clients.iter().map(|client| client.data_size).sum()
    }

    /// Adds a client with [`DEFAULT_CLIENT_DATA_SIZE`] samples and returns its id.
    ///
    /// # Errors
    /// Fails if there are already [`MAX_CLIENTS`] clients or if the new
    /// client would push the total data size above the cap.
    pub fn add_client(&mut self) -> Result<u32, ValidationError> {
        if self.clients.len() >= MAX_CLIENTS {
            return Err(ValidationError::TooManyClients(MAX_CLIENTS));
        }
        let total = self.total_data_size() + DEFAULT_CLIENT_DATA_SIZE;
        if total > TOTAL_DATA_SIZE_CAP {
            return Err(ValidationError::ClientWouldExceedCap {
                total,
                cap: TOTAL_DATA_SIZE_CAP,
            });
        }
        let id = self.clients.iter().map(|client| client.id).max().unwrap_or(0) + 1;
        self.clients
            .push(ClientSpec::new(id, DEFAULT_CLIENT_DATA_SIZE));
        Ok(id)
    }

    /// Removes the client with the given id. The last client is never removed.
    pub fn remove_client(&mut self, id: u32) -> Result<(), ValidationError> {
        if self.clients.len() <= 1 {
            return Err(ValidationError::LastClient);
        }
        let index = self.position(id)?;
        self.clients.remove(index);
        Ok(())
    }

    /// Changes the number of samples of a client.
    ///
    /// Exceeding the cap is allowed at this point; check [`warning()`]
    /// to tell the user about it.
    ///
    /// [`warning()`]: ClientSetup::warning
    pub fn set_data_size(&mut self, id: u32, size: u64) -> Result<(), ValidationError> {
        check_data_size(size)?;
        let index = self.position(id)?;
        self.clients[index].data_size = size;
        Ok(())
    }

    /// Returns an advisory about the current total data size, if any.
    pub fn warning(&self) -> Option<LoadWarning> {
        let total = self.total_data_size();
        if total > TOTAL_DATA_SIZE_CAP {
            Some(LoadWarning::ExceedsCap(total))
        } else if total > HIGH_LOAD_DATA_SIZE {
            Some(LoadWarning::HighLoad(total))
        } else {
            None
        }
    }

    /// Derives the configuration to submit, taking every parameter but
    /// the number of clients from `template`.
    ///
    /// # Errors
    /// Fails if the total data size exceeds [`TOTAL_DATA_SIZE_CAP`] or
    /// if the resulting configuration is invalid.
    pub fn configure(
        &self,
        template: TrainingConfiguration,
    ) -> Result<TrainingConfiguration, ValidationError> {
        let total = self.total_data_size();
        if total > TOTAL_DATA_SIZE_CAP {
            return Err(ValidationError::DataSizeCap {
                total,
                cap: TOTAL_DATA_SIZE_CAP,
            });
        }
        let config = TrainingConfiguration {
            num_clients: self.clients.len() as u32,
            ..template
        };
        config.validate()?;
        Ok(config)
    }

    fn position(&self, id: u32) -> Result<usize, ValidationError> {
        self.clients
            .iter()
            .position(|client| client.id == id)
            .ok_or(ValidationError::UnknownClient(id))
    }
}

fn check_data_size(size: u64) -> Result<(), ValidationError> {
    if (MIN_CLIENT_DATA_SIZE..=MAX_CLIENT_DATA_SIZE).contains(&size)
        && size % CLIENT_DATA_SIZE_STEP == 0
    {
        Ok(())
    } else {
        Err(ValidationError::InvalidDataSize {
            size,
            min: MIN_CLIENT_DATA_SIZE,
            max: MAX_CLIENT_DATA_SIZE,
            step: CLIENT_DATA_SIZE_STEP,
        })
    }
}
