use serde::{Deserialize, Serialize};

/// The fixed set of appointment fields collected over a call, in priority
/// order.  `missing()` and follow-up prompts always use this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKey {
    PatientName,
    AppointmentReason,
    PreferredDate,
    PreferredTime,
    DoctorPreference,
}

impl SlotKey {
    pub const ALL: [SlotKey; 5] = [
        SlotKey::PatientName,
        SlotKey::AppointmentReason,
        SlotKey::PreferredDate,
        SlotKey::PreferredTime,
        SlotKey::DoctorPreference,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SlotKey::PatientName => "patient_name",
            SlotKey::AppointmentReason => "appointment_reason",
            SlotKey::PreferredDate => "preferred_date",
            SlotKey::PreferredTime => "preferred_time",
            SlotKey::DoctorPreference => "doctor_preference",
        }
    }

    /// Spoken label used when prompting the caller for this slot.
    pub fn label(&self) -> &'static str {
        match self {
            SlotKey::PatientName => "your full name",
            SlotKey::AppointmentReason => "the reason for your visit",
            SlotKey::PreferredDate => "the date you prefer",
            SlotKey::PreferredTime => "the time you prefer",
            SlotKey::DoctorPreference => "any doctor preference",
        }
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Collected slot values for one call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slots {
    pub patient_name: Option<String>,
    pub appointment_reason: Option<String>,
    pub preferred_date: Option<String>,
    pub preferred_time: Option<String>,
    pub doctor_preference: Option<String>,
}

impl Slots {
    pub fn get(&self, key: SlotKey) -> Option<&str> {
        let value = match key {
            SlotKey::PatientName => &self.patient_name,
            SlotKey::AppointmentReason => &self.appointment_reason,
            SlotKey::PreferredDate => &self.preferred_date,
            SlotKey::PreferredTime => &self.preferred_time,
            SlotKey::DoctorPreference => &self.doctor_preference,
        };
        value.as_deref()
    }

    fn slot_mut(&mut self, key: SlotKey) -> &mut Option<String> {
        match key {
            SlotKey::PatientName => &mut self.patient_name,
            SlotKey::AppointmentReason => &mut self.appointment_reason,
            SlotKey::PreferredDate => &mut self.preferred_date,
            SlotKey::PreferredTime => &mut self.preferred_time,
            SlotKey::DoctorPreference => &mut self.doctor_preference,
        }
    }

    /// Fold an extractor update into the stored slots.  A non-empty update
    /// value replaces the stored one (callers may correct themselves later in
    /// the call); `None` or whitespace never erases earlier progress.
    pub fn merge(&mut self, update: &SlotUpdate) {
        for key in SlotKey::ALL {
            if let Some(value) = update.get(key) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    *self.slot_mut(key) = Some(trimmed.to_string());
                }
            }
        }
    }

    /// Slot keys still unfilled, in the fixed priority order.
    pub fn missing(&self) -> Vec<SlotKey> {
        SlotKey::ALL
            .into_iter()
            .filter(|key| self.get(*key).map_or(true, |v| v.trim().is_empty()))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }
}

/// One turn's worth of extractor output: per-slot opinions plus a suggested
/// conversational reply.  Absent and `null` fields both mean "no new
/// information" and leave the stored value alone.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SlotUpdate {
    #[serde(default)]
    pub patient_name: Option<String>,
    #[serde(default)]
    pub appointment_reason: Option<String>,
    #[serde(default)]
    pub preferred_date: Option<String>,
    #[serde(default)]
    pub preferred_time: Option<String>,
    #[serde(default)]
    pub doctor_preference: Option<String>,
    #[serde(default)]
    pub reply: Option<String>,
}

impl SlotUpdate {
    pub fn get(&self, key: SlotKey) -> Option<&str> {
        let value = match key {
            SlotKey::PatientName => &self.patient_name,
            SlotKey::AppointmentReason => &self.appointment_reason,
            SlotKey::PreferredDate => &self.preferred_date,
            SlotKey::PreferredTime => &self.preferred_time,
            SlotKey::DoctorPreference => &self.doctor_preference,
        };
        value.as_deref()
    }
}

pub fn followup_prompt(key: SlotKey) -> String {
    format!("Could you please share {}?", key.label())
}

/// Spoken confirmation once every slot is filled.
pub fn confirmation_message(slots: &Slots) -> String {
    let doctor = slots
        .get(SlotKey::DoctorPreference)
        .filter(|v| !v.trim().is_empty())
        .map(|v| format!("with {v}"))
        .unwrap_or_else(|| "with the next available specialist".to_string());
    format!(
        "Thanks {}. I've noted a {} visit on {} at {} {}. You will receive a confirmation message shortly.",
        slots.get(SlotKey::PatientName).unwrap_or(""),
        slots.get(SlotKey::AppointmentReason).unwrap_or(""),
        slots.get(SlotKey::PreferredDate).unwrap_or(""),
        slots.get(SlotKey::PreferredTime).unwrap_or(""),
        doctor,
    )
}
