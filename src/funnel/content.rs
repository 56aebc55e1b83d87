//! Scripted funnel content.
//!
//! Everything here is pure: (stage, contact data) in, message bodies and
//! outbound commands out. Links come from [`ContentConfig`].

use chrono::Duration;

use super::command::{ButtonOption, ListRow, ListSection, OutboundCommand};
use super::followup::FollowUpKind;
use crate::config::ContentConfig;
use crate::contacts::{Profile, Track};

/// Button ids the funnel emits and understands.
pub mod buttons {
    pub const YES_CALL: &str = "yes_call";
    pub const NO_CALL: &str = "no_call";
    pub const ROI_CALC: &str = "roi_calc";
    pub const COST_PLAN: &str = "cost_plan";
    pub const SCHEDULE_CALL: &str = "schedule_call";
    pub const YES_REFERRAL: &str = "yes_referral";
    pub const NO_REFERRAL: &str = "no_referral";
    pub const YES_DEMO: &str = "yes_demo";
    pub const NO_DEMO: &str = "no_demo";
    pub const OPT_OUT: &str = "opt_out";
}

pub const MENU_SECTION_TITLE: &str = "Angill Options";
pub const MENU_BUTTON_LABEL: &str = "Select Option";

/// Default gap between paced messages.
pub const DEFAULT_PRESENTATION_DELAY_MS: i64 = 2000;

/// A document the funnel can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Document {
    CyberClinicBrochure,
    RoiCalculation,
    CostPlan,
}

impl Document {
    pub fn filename(&self) -> &'static str {
        match self {
            Self::CyberClinicBrochure => "Cyber_Clinic_Brochure.pdf",
            Self::RoiCalculation => "ROI_Calculation.pdf",
            Self::CostPlan => "Cost_Plan.pdf",
        }
    }

    pub fn caption(&self) -> &'static str {
        match self {
            Self::CyberClinicBrochure => "Angill Cyber Clinic Brochure",
            Self::RoiCalculation => "ROI Calculation for Cyber Clinic",
            Self::CostPlan => "Cost & Installment Plan",
        }
    }
}

/// Content lookup plus pacing.
#[derive(Debug, Clone)]
pub struct ContentCatalog {
    links: ContentConfig,
    presentation_delay: Duration,
}

impl Default for ContentCatalog {
    fn default() -> Self {
        Self::new(
            ContentConfig::default(),
            std::time::Duration::from_millis(DEFAULT_PRESENTATION_DELAY_MS as u64),
        )
    }
}

impl ContentCatalog {
    pub fn new(links: ContentConfig, presentation_delay: std::time::Duration) -> Self {
        let presentation_delay = Duration::from_std(presentation_delay)
            .unwrap_or_else(|_| Duration::milliseconds(DEFAULT_PRESENTATION_DELAY_MS));
        Self {
            links,
            presentation_delay,
        }
    }

    pub fn links(&self) -> &ContentConfig {
        &self.links
    }

    pub fn presentation_delay(&self) -> Duration {
        self.presentation_delay
    }

    // ── Profile collection ──────────────────────────────────────────

    pub fn welcome(&self) -> String {
        "🙏 *Thank you for your interest in ANGILL Hybrid Healthcare!*\n\n\
         I'm here to help you.\n\n\
         Before we proceed, may I know:\n\n\
         *1️⃣ Your Full Name?*"
            .to_string()
    }

    pub fn city_prompt(&self, name: &str) -> String {
        format!(
            "Great, *{}*! 👨‍⚕️\n\n*2️⃣ Which city are you from?* 🏙️",
            salutation(name)
        )
    }

    pub fn specialty_prompt(&self, city: &str) -> String {
        format!(
            "Great! {city} 📍\n\n*3️⃣ What is your specialty?*\n\n\
             _Example: Cardiologist, Dentist, Orthopedic, General Physician_"
        )
    }

    pub fn profile_confirmation(&self, profile: &Profile) -> String {
        format!(
            "✅ *Thank you {}!*\n\n\
             Your details have been saved:\n\
             📍 *City:* {}\n\
             🩺 *Specialty:* {}\n\n\
             Let me show you the options... 👇",
            salutation(profile.display_name()),
            profile.city.as_deref().unwrap_or(""),
            profile.specialty.as_deref().unwrap_or(""),
        )
    }

    // ── Menu ────────────────────────────────────────────────────────

    pub fn menu(&self, to: &str) -> OutboundCommand {
        let rows = Track::ALL
            .iter()
            .map(|track| {
                let (title, description) = match track {
                    Track::OnlineDoctor => ("Online Doctor", "Join as Online Consulting Doctor"),
                    Track::CyberClinic => ("Cyber Clinic", "Convert clinic to Angill Cyber Clinic"),
                    Track::Referral => ("Referral Program", "Earn by referring doctors"),
                    Track::SmartCalendar => ("Smart Calendar", "Patent Pending Dual Slot System"),
                };
                ListRow {
                    id: track.id().to_string(),
                    title: title.to_string(),
                    description: description.to_string(),
                }
            })
            .collect();

        OutboundCommand::SendList {
            to: to.to_string(),
            body: "🔹 *Please choose what you want to explore:*".to_string(),
            button_label: MENU_BUTTON_LABEL.to_string(),
            sections: vec![ListSection {
                title: MENU_SECTION_TITLE.to_string(),
                rows,
            }],
        }
    }

    pub fn menu_nudge(&self) -> String {
        "Please select from the menu options or type \"menu\".".to_string()
    }

    pub fn general_help(&self) -> String {
        "How else can I help you?\n\n_Type \"menu\" for main menu._".to_string()
    }

    // ── Tracks ──────────────────────────────────────────────────────

    pub fn track_intro(&self, track: Track, name: &str) -> String {
        let who = salutation(name);
        match track {
            Track::OnlineDoctor => format!(
                "🎥 *{who}, here's what you need:*\n\n\
                 *Onboarding Video (2 min):*\n{video}\n\n\
                 After watching the video, please register below:\n\n\
                 👉 *Registration Link:*\n{register}\n\n\
                 _After registration, our team will activate your profile within 24 hours._\n\n\
                 *Would you like to schedule a 5-minute orientation call?*",
                video = self.links.onboarding_video_url,
                register = self.links.registration_url,
            ),
            Track::CyberClinic => format!(
                "🏥 *Cyber Clinic - {who}*\n\n\
                 *A Cyber Clinic helps you:*\n\
                 ✔ Increase daily consultations\n\
                 ✔ Use Smart Calendar (Patent Pending)\n\
                 ✔ Double booking capacity\n\
                 ✔ Offer online + walk-in patients\n\
                 ✔ Earn higher monthly income\n\n\
                 📄 *Cyber Clinic Brochure (PDF):*\n_Sending document..._"
            ),
            Track::Referral => format!(
                "💰 *Referral Program - {who}*\n\n\
                 *Our referral program offers attractive earnings:*\n\n\
                 🔹 Earn *Rs. 7,500 instantly*\n\
                 🔹 Another *Rs. 7,500* after contract maturity\n\
                 🔹 *No limit*, earn from multiple referrals\n\n\
                 *Would you like to generate your unique referral link?*"
            ),
            Track::SmartCalendar => format!(
                "📅 *Smart Calendar - {who}*\n\n\
                 *Our patent-pending Dual Slot Calendar:*\n\
                 ✔ Doubles your appointment capacity\n\
                 ✔ Syncs clinic + online slots\n\
                 ✔ Auto-closes one when the other is booked\n\
                 ✔ Increases profitability by ~25%\n\n\
                 🎥 *Watch Demo:*\n{demo}\n\n\
                 *Would you like a live demo?*",
                demo = self.links.smart_calendar_demo_url,
            ),
        }
    }

    /// The button prompt that follows a track's intro.
    pub fn track_prompt(&self, to: &str, track: Track) -> OutboundCommand {
        use buttons::*;
        let (body, options) = match track {
            Track::OnlineDoctor => (
                "Schedule orientation call?",
                vec![
                    ButtonOption::new(YES_CALL, "✅ Yes, Book Call"),
                    ButtonOption::new(NO_CALL, "❌ No, Later"),
                ],
            ),
            Track::CyberClinic => (
                "What would you like to see?",
                vec![
                    ButtonOption::new(ROI_CALC, "💰 ROI Calculation"),
                    ButtonOption::new(COST_PLAN, "💳 Cost & Installment"),
                    ButtonOption::new(SCHEDULE_CALL, "📞 Schedule Call"),
                ],
            ),
            Track::Referral => (
                "Generate your referral link?",
                vec![
                    ButtonOption::new(YES_REFERRAL, "✅ Yes, Generate"),
                    ButtonOption::new(NO_REFERRAL, "❌ Not Now"),
                ],
            ),
            Track::SmartCalendar => (
                "Schedule live demo?",
                vec![
                    ButtonOption::new(YES_DEMO, "✅ Yes, Show Me"),
                    ButtonOption::new(NO_DEMO, "❌ Video is Enough"),
                ],
            ),
        };
        OutboundCommand::buttons(to, body, options)
    }

    pub fn document(&self, to: &str, doc: Document) -> OutboundCommand {
        let url = match doc {
            Document::CyberClinicBrochure => &self.links.cyber_clinic_pdf_url,
            Document::RoiCalculation => &self.links.roi_pdf_url,
            Document::CostPlan => &self.links.cost_plan_pdf_url,
        };
        OutboundCommand::document(to, url, doc.caption(), doc.filename())
    }

    pub fn book_call(&self, name: &str) -> String {
        format!(
            "📞 *Book Your Call - {}*\n\n\
             Choose your preferred time slot:\n\n\
             🔗 *Calendly Link:*\n{}\n\n\
             _You'll receive a reminder before the call!_",
            salutation(name),
            self.links.calendly_url
        )
    }

    /// Acknowledgement for a "not now" answer in `track`.
    pub fn decline_ack(&self, track: Track) -> String {
        match track {
            Track::SmartCalendar => "That's fine! The video is quite informative.\n\n\
                 If you need a live demo later, feel free to let me know! 😊\n\n\
                 _Main menu: Type 'menu'_"
                .to_string(),
            Track::Referral => "No problem! Feel free to message me when you're ready. 😊\n\n\
                 _Type 'menu' to see main menu._"
                .to_string(),
            Track::OnlineDoctor | Track::CyberClinic => {
                "No problem! Feel free to message me when you're ready. 😊".to_string()
            }
        }
    }

    pub fn referral_issued(&self, name: &str, code: &str, link: &str) -> String {
        format!(
            "🎉 *Congratulations {}!*\n\n\
             Your unique referral link is ready:\n\n\
             🔗 *Your Referral Link:*\n{link}\n\n\
             *How it works:*\n\
             1️⃣ Share this link with your doctor friends\n\
             2️⃣ When they register via your link\n\
             3️⃣ You earn *Rs. 7,500 instantly*\n\
             4️⃣ Another *Rs. 7,500* after 6 months\n\n\
             *Referral Code:* `{code}`\n\n\
             _Share and earn! 💰_",
            salutation(name)
        )
    }

    pub fn opt_out_ack(&self) -> String {
        "You've been unsubscribed and won't receive further reminders. \
         Message us any time if you change your mind. 🙏"
            .to_string()
    }

    // ── Drip ────────────────────────────────────────────────────────

    /// Follow-up body. Independent of the selected track.
    pub fn follow_up(&self, kind: FollowUpKind, name: &str) -> String {
        let who = salutation(name);
        match kind {
            FollowUpKind::Reminder => format!(
                "👋 *{who}*\n\n\
                 This is a quick reminder.\n\n\
                 You had inquired about Angill. I hope you received all the details you needed.\n\n\
                 If you need any help or have any questions, please feel free to reply.\n\n\
                 _I'm here to help!_ 😊"
            ),
            FollowUpKind::SuccessStory => format!(
                "⭐ *{who}*\n\n\
                 I'd like to share a success story:\n\n\
                 *Dr. Ahmed (Karachi)* joined Angill 3 months ago. He increased his monthly \
                 income by *35%* just by using the Smart Calendar.\n\n\
                 He now has:\n\
                 ✔ Double appointments\n\
                 ✔ Online + clinic consultations\n\
                 ✔ Better time management\n\n\
                 Would you also like these benefits?\n\n\
                 _Reply and I'll help you get started!_ 🚀"
            ),
            FollowUpKind::BenefitsRecap => format!(
                "📋 *{who}*\n\n\
                 Angill's *key benefits* at a glance:\n\n\
                 💰 *25-40% more income*\n\
                 📅 Smart Calendar (Patent Pending)\n\
                 🏥 Hybrid model (Online + Clinic)\n\
                 📱 Easy digital management\n\
                 💳 Flexible payment plans\n\n\
                 *Only 50 slots available for doctors.*\n\n\
                 Are you interested?\n\n\
                 _If yes, please reply \"Yes\"!_ ✅"
            ),
            FollowUpKind::FinalNotice => format!(
                "🕐 *{who}*\n\n\
                 This is my last message.\n\n\
                 Angill is onboarding the *next 50 doctors* with *early benefits + priority listing*.\n\n\
                 If you're interested, please:\n\
                 1️⃣ Reply \"Interested\"\n\
                 2️⃣ Or book a call directly: {calendly}\n\n\
                 *If you're not interested*, that's okay. I won't disturb you anymore.\n\n\
                 _Best wishes!_ 🙏",
                calendly = self.links.calendly_url,
            ),
        }
    }
}

/// "Dr. <name>", without doubling a title the contact typed themselves.
pub fn salutation(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        return "Doctor".to_string();
    }
    let lower = name.to_lowercase();
    if lower.starts_with("dr.") || lower.starts_with("dr ") {
        name.to_string()
    } else {
        format!("Dr. {name}")
    }
}
