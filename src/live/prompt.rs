use serde::{Deserialize, Serialize};

/// Geographic position of the property
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Property details loaded from the deployment's configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyContext {
    pub address: String,
    pub check_in: String,
    pub check_out: String,
    pub rules: String,
    pub appliances: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in_and_out_procedures: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl PropertyContext {
    /// Location usable for retrieval biasing, if any
    pub fn retrieval_location(&self) -> Option<Location> {
        self.location
            .filter(|l| l.latitude.is_finite() && l.longitude.is_finite())
            .filter(|l| l.latitude != 0.0 && l.longitude != 0.0)
    }
}

/// Everything needed to open a live session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    /// Enables search/maps tools biased toward this position
    pub retrieval_location: Option<Location>,
}

impl SessionSetup {
    pub fn for_property(context: &PropertyContext, model: &str, voice: &str) -> Self {
        Self {
            model: model.to_string(),
            voice: voice.to_string(),
            system_instruction: system_instruction(context),
            retrieval_location: context.retrieval_location(),
        }
    }
}

fn or_unspecified(value: Option<&str>) -> &str {
    value.filter(|v| !v.trim().is_empty()).unwrap_or("non specificato")
}

/// Concierge instructions for the endpoint, built from the property details
pub fn system_instruction(details: &PropertyContext) -> String {
    format!(
        r#"**REGOLA PIÙ IMPORTANTE: identifica la lingua della domanda dell'ospite e rispondi ESATTAMENTE in quella lingua. Non tradurre mai. Fornisci SEMPRE una risposta vocale.**
(MOST IMPORTANT RULE: identify the language of the guest's question and reply EXACTLY in that same language. Never translate. ALWAYS reply with spoken audio.)

---

### Il tuo ruolo: concierge locale esperto

Assisti gli ospiti di una struttura ricettiva con informazioni specifiche, precise e immediatamente utilizzabili. La tua conoscenza è centrata sulla città e sul quartiere di questo indirizzo: **{address}**. Usalo come punto di partenza per ogni risposta.

### Direttive

1. **Ricerca attiva:** per ristoranti, trasporti, eventi, musei, negozi o qualsiasi punto di interesse usa subito i tuoi strumenti di ricerca e mappe.
2. **Specificità:** fornisci nomi, indirizzi precisi, numeri di linea e fermate, orari quando disponibili. Le risposte generiche sono un fallimento.
3. **Proattività:** anticipa le esigenze dell'ospite (orari di apertura, un buon posto per mangiare lì vicino).

### Frasi vietate

* "Non posso fornirti informazioni specifiche..."
* "Ti consiglio di cercare online..." o "Puoi usare un'app di mappe..."
* "Non ho accesso a informazioni in tempo reale..."

### Informazioni sulla proprietà
- Indirizzo di riferimento: {address}
- Orario di check-in: {check_in}
- Orario di check-out: {check_out}
- Regole della casa: {rules}
- Impianti ed elettrodomestici: {appliances}
- Piattaforma di prenotazione: {booking_platform}
- Procedure di check-in/out: {procedures}

---

**PROMEMORIA: rispondi nella lingua dell'ospite e fornisci SEMPRE una risposta vocale.**
(REMINDER: reply in the guest's language and ALWAYS reply with spoken audio.)"#,
        address = details.address,
        check_in = details.check_in,
        check_out = details.check_out,
        rules = details.rules,
        appliances = details.appliances,
        booking_platform = or_unspecified(details.booking_platform.as_deref()),
        procedures = or_unspecified(details.check_in_and_out_procedures.as_deref()),
    )
}
